/// Parsed pieces of a template identifier.
///
/// Three on-the-wire formats are accepted:
///   colon-dot:   `hash:Module.Path:Entity`
///   simple:      `Module.Path:Entity`
///   underscore:  `hash_Module_Entity`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TemplateId {
    pub package_name: Option<String>,
    pub module_name: Option<String>,
    pub entity_name: Option<String>,
}

pub fn parse_template_id(raw: &str) -> TemplateId {
    let raw = raw.trim();
    if raw.is_empty() {
        return TemplateId::default();
    }

    let colon_parts: Vec<&str> = raw.split(':').collect();
    match colon_parts.len() {
        3 => {
            return TemplateId {
                package_name: Some(colon_parts[0].to_string()),
                module_name: Some(colon_parts[1].to_string()),
                entity_name: Some(colon_parts[2].to_string()),
            };
        }
        2 => {
            return TemplateId {
                package_name: None,
                module_name: Some(colon_parts[0].to_string()),
                entity_name: Some(colon_parts[1].to_string()),
            };
        }
        _ => {}
    }

    // Underscore form: hash_Module_Entity. The hash never contains an
    // underscore, the module may (Splice_Amulet style modules do not,
    // but dotted paths are collapsed), so split from both ends.
    let under_parts: Vec<&str> = raw.split('_').collect();
    if under_parts.len() >= 3 {
        return TemplateId {
            package_name: Some(under_parts[0].to_string()),
            module_name: Some(under_parts[1..under_parts.len() - 1].join("_")),
            entity_name: Some(under_parts[under_parts.len() - 1].to_string()),
        };
    }

    // Nothing matched; keep the raw value as the entity so it is not
    // lost entirely.
    TemplateId {
        package_name: None,
        module_name: None,
        entity_name: Some(raw.to_string()),
    }
}

/// Hash-stripped `Module.Path:Entity` key, used for cross-format
/// equality between the colon and underscore forms.
pub fn normalize_template_key(raw: &str) -> Option<String> {
    let parsed = parse_template_id(raw);
    match (parsed.module_name, parsed.entity_name) {
        (Some(module), Some(entity)) => Some(format!("{}:{}", module, entity)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colon_dot_format() {
        let t = parse_template_id("67bc951a8fe7f7:Splice.Amulet:Amulet");
        assert_eq!(t.package_name.as_deref(), Some("67bc951a8fe7f7"));
        assert_eq!(t.module_name.as_deref(), Some("Splice.Amulet"));
        assert_eq!(t.entity_name.as_deref(), Some("Amulet"));
    }

    #[test]
    fn test_simple_colon_format() {
        let t = parse_template_id("Splice.Amulet:Amulet");
        assert_eq!(t.package_name, None);
        assert_eq!(t.module_name.as_deref(), Some("Splice.Amulet"));
        assert_eq!(t.entity_name.as_deref(), Some("Amulet"));
    }

    #[test]
    fn test_underscore_format() {
        let t = parse_template_id("67bc951a8fe7f7_Amulet_Amulet");
        assert_eq!(t.package_name.as_deref(), Some("67bc951a8fe7f7"));
        assert_eq!(t.module_name.as_deref(), Some("Amulet"));
        assert_eq!(t.entity_name.as_deref(), Some("Amulet"));
    }

    #[test]
    fn test_normalized_key_strips_hash() {
        assert_eq!(
            normalize_template_key("67bc951a8fe7f7:Splice.Amulet:Amulet").as_deref(),
            Some("Splice.Amulet:Amulet")
        );
        assert_eq!(
            normalize_template_key("Splice.Amulet:Amulet").as_deref(),
            Some("Splice.Amulet:Amulet")
        );
    }

    #[test]
    fn test_unrecognized_keeps_raw_as_entity() {
        let t = parse_template_id("Amulet");
        assert_eq!(t.package_name, None);
        assert_eq!(t.module_name, None);
        assert_eq!(t.entity_name.as_deref(), Some("Amulet"));
        assert_eq!(normalize_template_key("Amulet"), None);
    }

    #[test]
    fn test_empty_is_all_none() {
        assert_eq!(parse_template_id(""), TemplateId::default());
    }
}
