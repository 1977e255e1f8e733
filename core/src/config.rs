//! Supervisor configuration loading
//!
//! Configuration is TOML deserialized into [`schema::SupervisorConfig`];
//! every knob has a default, so an empty file (or no file at all) yields a
//! working configuration. Validation failures name the offending field.

use crate::error::{CoreError, Result};
use schema::SupervisorConfig;
use std::path::Path;
use tracing::debug;

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        CoreError::ConfigurationError(format!("cannot read {}: {e}", path.display()))
    })?;
    let config = parse_config(&text)?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Parse and validate configuration from TOML text
pub fn parse_config(text: &str) -> Result<SupervisorConfig> {
    let config: SupervisorConfig = toml::from_str(text)
        .map_err(|e| CoreError::ConfigurationError(format!("invalid configuration: {e}")))?;
    validate(&config)?;
    Ok(config)
}

/// Check that the configuration is internally consistent
pub fn validate(config: &SupervisorConfig) -> Result<()> {
    if config.term_grace_secs == 0 {
        return Err(CoreError::ValidationError(
            "termGraceSecs must be at least 1".to_string(),
        ));
    }
    if config.busy_interval_ms == 0 {
        return Err(CoreError::ValidationError(
            "busyIntervalMs must be at least 1".to_string(),
        ));
    }
    if config.idle_interval_ms < config.busy_interval_ms {
        return Err(CoreError::ValidationError(
            "idleIntervalMs must be at least busyIntervalMs".to_string(),
        ));
    }
    let launcher = &config.launcher;
    if let (Some(min), Some(max)) = (launcher.min_pool, launcher.max_pool) {
        if min > max {
            return Err(CoreError::ValidationError(
                "launcher.minPool must not exceed launcher.maxPool".to_string(),
            ));
        }
    }
    if launcher.idle_reap_secs == Some(0) {
        return Err(CoreError::ValidationError(
            "launcher.idleReapSecs must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").expect("parse");
        assert_eq!(config, SupervisorConfig::default());
    }

    #[test]
    fn test_parse_overrides() {
        let config = parse_config(
            r#"
            termGraceSecs = 10
            busyIntervalMs = 5

            [launcher]
            helperPath = "/opt/server/bin/cgistub"
            minPool = 2
            maxPool = 16
            "#,
        )
        .expect("parse");
        assert_eq!(config.term_grace_secs, 10);
        assert_eq!(config.busy_interval_ms, 5);
        assert_eq!(config.idle_interval_ms, 1000);
        assert_eq!(
            config.launcher.helper_path.as_deref(),
            Some("/opt/server/bin/cgistub")
        );
        assert_eq!(config.launcher.min_pool, Some(2));
    }

    #[test]
    fn test_validation_names_the_field() {
        let err = parse_config("termGraceSecs = 0").unwrap_err();
        assert!(err.to_string().contains("termGraceSecs"));

        let err = parse_config("busyIntervalMs = 200\nidleIntervalMs = 100").unwrap_err();
        assert!(err.to_string().contains("idleIntervalMs"));

        let err = parse_config("[launcher]\nminPool = 8\nmaxPool = 2").unwrap_err();
        assert!(err.to_string().contains("launcher.minPool"));
    }

    #[test]
    fn test_malformed_toml_is_a_configuration_error() {
        let err = parse_config("termGraceSecs = ").unwrap_err();
        assert!(matches!(err, CoreError::ConfigurationError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "termGraceSecs = 7").expect("write");
        let config = load_config(file.path()).expect("load");
        assert_eq!(config.term_grace_secs, 7);

        let err = load_config(Path::new("/no/such/config.toml")).unwrap_err();
        assert!(matches!(err, CoreError::ConfigurationError(_)));
    }
}
