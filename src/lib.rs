pub mod config;
pub mod cursor;
pub mod indexer;
pub mod metrics;
pub mod partition;
pub mod repair;
pub mod scan_api;
pub mod schema;
pub mod store;
pub mod uploader;
pub mod writer;
