use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub scan: ScanSettings,
    pub storage: StorageSettings,
    pub gcs: GcsSettings,
    pub uploader: UploaderSettings,
    pub indexer: IndexerSettings,
    pub acs: AcsSettings,
    #[serde(default)]
    pub application: ApplicationSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9102
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanSettings {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_page_size() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub raw_dir: Option<String>,
    #[serde(default)]
    pub cursor_dir: Option<String>,
    #[serde(default)]
    pub tmp_dir: Option<String>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl StorageSettings {
    pub fn raw_dir(&self) -> PathBuf {
        self.raw_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&self.data_dir).join("raw"))
    }

    pub fn cursor_dir(&self) -> PathBuf {
        self.cursor_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&self.data_dir).join("cursors"))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&self.data_dir).join("tmp"))
    }

    pub fn dead_letter_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("dead_letter.jsonl")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GcsSettings {
    #[serde(default)]
    pub bucket: Option<String>,
    /// Defaults to true when a bucket is configured.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default = "default_gcs_prefix")]
    pub prefix: String,
}

fn default_gcs_prefix() -> String {
    "raw".to_string()
}

impl GcsSettings {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(self.bucket.is_some())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploaderSettings {
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,
    #[serde(default = "default_queue_low_water")]
    pub queue_low_water: usize,
    #[serde(default = "default_byte_high_water")]
    pub byte_high_water: u64,
    #[serde(default = "default_byte_low_water")]
    pub byte_low_water: u64,
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_queue_high_water() -> usize {
    500
}

fn default_queue_low_water() -> usize {
    200
}

fn default_byte_high_water() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_byte_low_water() -> u64 {
    512 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_backfill_slices")]
    pub backfill_slices: usize,
    #[serde(default = "default_writer_workers")]
    pub writer_workers: usize,
    #[serde(default = "default_flush_rows")]
    pub flush_rows: usize,
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
    #[serde(default = "default_synchronizer_id")]
    pub synchronizer_id: String,
    #[serde(default)]
    pub migration_id: i64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub strict: bool,
}

fn default_batch_size() -> usize {
    100
}

fn default_backfill_slices() -> usize {
    4
}

fn default_writer_workers() -> usize {
    2
}

fn default_flush_rows() -> usize {
    5_000
}

fn default_flush_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_seen_capacity() -> usize {
    100_000
}

fn default_synchronizer_id() -> String {
    "global".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcsSettings {
    #[serde(default = "default_acs_enabled")]
    pub enabled: bool,
    #[serde(default = "default_acs_migrations")]
    pub migrations: Vec<i64>,
    #[serde(default = "default_acs_page_size")]
    pub page_size: usize,
}

fn default_acs_enabled() -> bool {
    true
}

fn default_acs_migrations() -> Vec<i64> {
    vec![0]
}

fn default_acs_page_size() -> usize {
    1_000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(Environment::default().separator("__"))
            // Seed one key per section so partial configs deserialize;
            // field-level serde defaults fill in the rest.
            .set_default("scan.url", "http://localhost:5012/api/scan")?
            .set_default("storage.data_dir", "./data")?
            .set_default("gcs.prefix", "raw")?
            .set_default("uploader.concurrency", 4)?
            .set_default("indexer.batch_size", 100)?
            .set_default("acs.enabled", true)?
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.apply_overrides(&|name| std::env::var(name).ok());
        Ok(settings)
    }

    /// Apply the flat environment variables the deployment recognizes.
    /// Unknown variables are ignored; malformed numeric values fall
    /// back to the configured value.
    pub fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SCAN_URL") {
            self.scan.url = v;
        }
        if let Some(v) = lookup("API_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.scan.timeout_ms = v;
        }
        // Only the exact lowercase string "true" disables verification.
        self.scan.insecure_tls = match lookup("INSECURE_TLS") {
            Some(v) => v == "true",
            None => self.scan.insecure_tls,
        };
        if let Some(v) = lookup("BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.indexer.batch_size = v;
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.storage.data_dir = v;
        }
        if let Some(v) = lookup("RAW_DIR") {
            self.storage.raw_dir = Some(v);
        }
        if let Some(v) = lookup("CURSOR_DIR") {
            self.storage.cursor_dir = Some(v);
        }
        if let Some(v) = lookup("TMP_DIR") {
            self.storage.tmp_dir = Some(v);
        }
        if let Some(v) = lookup("GCS_BUCKET") {
            self.gcs.bucket = Some(v);
        }
        if let Some(v) = lookup("GCS_ENABLED").and_then(|v| v.parse().ok()) {
            self.gcs.enabled = Some(v);
        }
        if let Some(v) = lookup("GCS_QUEUE_HIGH_WATER").and_then(|v| v.parse().ok()) {
            self.uploader.queue_high_water = v;
        }
        if let Some(v) = lookup("GCS_QUEUE_LOW_WATER").and_then(|v| v.parse().ok()) {
            self.uploader.queue_low_water = v;
        }
        if let Some(v) = lookup("GCS_BYTE_HIGH_WATER").and_then(|v| v.parse().ok()) {
            self.uploader.byte_high_water = v;
        }
        if let Some(v) = lookup("GCS_BYTE_LOW_WATER").and_then(|v| v.parse().ok()) {
            self.uploader.byte_low_water = v;
        }
        if let Some(v) = lookup("GCS_UPLOAD_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.uploader.concurrency = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> Settings {
        Settings {
            scan: ScanSettings {
                url: "http://localhost:5012/api/scan".to_string(),
                timeout_ms: default_timeout_ms(),
                insecure_tls: false,
                page_size: default_page_size(),
            },
            storage: StorageSettings {
                data_dir: default_data_dir(),
                raw_dir: None,
                cursor_dir: None,
                tmp_dir: None,
            },
            gcs: GcsSettings::default(),
            uploader: UploaderSettings {
                concurrency: default_upload_concurrency(),
                queue_high_water: default_queue_high_water(),
                queue_low_water: default_queue_low_water(),
                byte_high_water: default_byte_high_water(),
                byte_low_water: default_byte_low_water(),
            },
            indexer: IndexerSettings {
                batch_size: default_batch_size(),
                backfill_slices: default_backfill_slices(),
                writer_workers: default_writer_workers(),
                flush_rows: default_flush_rows(),
                flush_bytes: default_flush_bytes(),
                seen_capacity: default_seen_capacity(),
                synchronizer_id: default_synchronizer_id(),
                migration_id: 0,
                poll_interval_secs: default_poll_interval_secs(),
                strict: false,
            },
            acs: AcsSettings {
                enabled: default_acs_enabled(),
                migrations: default_acs_migrations(),
                page_size: default_acs_page_size(),
            },
            application: ApplicationSettings::default(),
        }
    }

    fn lookup<'a>(vars: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| vars.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_flat_env_overrides() {
        let mut settings = base();
        let vars = HashMap::from([
            ("SCAN_URL", "https://scan.example.com/api/scan"),
            ("API_TIMEOUT_MS", "45000"),
            ("GCS_BUCKET", "my-lake"),
            ("GCS_QUEUE_HIGH_WATER", "50"),
            ("BATCH_SIZE", "250"),
            ("UNRELATED_VARIABLE", "ignored"),
        ]);
        settings.apply_overrides(&lookup(&vars));

        assert_eq!(settings.scan.url, "https://scan.example.com/api/scan");
        assert_eq!(settings.scan.timeout_ms, 45_000);
        assert_eq!(settings.gcs.bucket.as_deref(), Some("my-lake"));
        assert_eq!(settings.uploader.queue_high_water, 50);
        assert_eq!(settings.indexer.batch_size, 250);
    }

    #[test]
    fn test_insecure_tls_requires_exact_true() {
        for (value, expected) in [
            ("true", true),
            ("TRUE", false),
            ("True", false),
            ("1", false),
            ("yes", false),
            ("", false),
        ] {
            let mut settings = base();
            let vars = HashMap::from([("INSECURE_TLS", value)]);
            settings.apply_overrides(&lookup(&vars));
            assert_eq!(settings.scan.insecure_tls, expected, "value {value:?}");
        }
    }

    #[test]
    fn test_gcs_enabled_defaults_to_bucket_presence() {
        let mut settings = base();
        assert!(!settings.gcs.is_enabled());

        let vars = HashMap::from([("GCS_BUCKET", "my-lake")]);
        settings.apply_overrides(&lookup(&vars));
        assert!(settings.gcs.is_enabled());

        let vars = HashMap::from([("GCS_ENABLED", "false")]);
        settings.apply_overrides(&lookup(&vars));
        assert!(!settings.gcs.is_enabled());
    }

    #[test]
    fn test_malformed_numbers_keep_defaults() {
        let mut settings = base();
        let vars = HashMap::from([("API_TIMEOUT_MS", "soon"), ("BATCH_SIZE", "-")]);
        settings.apply_overrides(&lookup(&vars));
        assert_eq!(settings.scan.timeout_ms, 30_000);
        assert_eq!(settings.indexer.batch_size, 100);
    }

    #[test]
    fn test_storage_dirs_derive_from_data_dir() {
        let settings = base();
        assert_eq!(settings.storage.raw_dir(), PathBuf::from("./data/raw"));
        assert_eq!(settings.storage.cursor_dir(), PathBuf::from("./data/cursors"));
        assert_eq!(settings.storage.tmp_dir(), PathBuf::from("./data/tmp"));

        let mut settings = base();
        let vars = HashMap::from([("RAW_DIR", "/mnt/raw")]);
        settings.apply_overrides(&lookup(&vars));
        assert_eq!(settings.storage.raw_dir(), PathBuf::from("/mnt/raw"));
    }
}
