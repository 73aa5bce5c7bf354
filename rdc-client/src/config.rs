//! Client configuration.

use std::path::Path;

use rdc_core::SessionConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the command-line client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Everything handed to the session engine.
    pub session: SessionConfig,
    /// Logging.
    pub logging: LoggingConfig,
    /// Output written when the session ends.
    pub output: OutputConfig,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`.
    pub level: String,
    /// Seconds between statistics lines; 0 disables them.
    pub stats_interval_secs: u64,
}

/// Output written when the session ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Write the final framebuffer here as a binary PPM.
    pub snapshot: Option<std::path::PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            stats_interval_secs: 10,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClientConfig {
    /// Load from a TOML file, falling back to defaults when the file is
    /// missing. A file that exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| format!("invalid config {}: {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(format!("cannot read {}: {e}", path.display())),
        }
    }

    /// The default configuration as TOML.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Write the default config to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default_toml().map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rdc_core::OrderPolicy;

    #[test]
    fn default_config_serializes() {
        let text = ClientConfig::default_toml().unwrap();
        assert!(text.contains("[session]"));
        assert!(text.contains("colour_depth"));
        assert!(text.contains("[logging]"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let text = r#"
            [session]
            host = "desk.example"
            username = "alice"
            colour_depth = 8

            [session.order_policy]
            mode = "lenient"
            skip = [{ order_type = 0x0f, length = 12 }]
        "#;
        let cfg: ClientConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.session.host, "desk.example");
        assert_eq!(cfg.session.colour_depth, 8);
        assert_eq!(cfg.session.port, 3389);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.session.order_policy.skip_length(0x0f), Some(12));
        assert!(matches!(cfg.session.order_policy, OrderPolicy::Lenient { .. }));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("rdc-client-no-such-config.toml");
        let cfg = ClientConfig::load(&path).unwrap();
        assert_eq!(cfg.session.width, 1024);
    }

    #[test]
    fn written_default_loads_back() {
        let path =
            std::env::temp_dir().join(format!("rdc-client-default-{}.toml", std::process::id()));
        ClientConfig::write_default(&path).unwrap();
        let cfg = ClientConfig::load(&path).unwrap();
        let defaults = ClientConfig::default();
        assert_eq!(cfg.session.port, defaults.session.port);
        assert_eq!(cfg.session.width, defaults.session.width);
        assert_eq!(cfg.logging.stats_interval_secs, 10);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn broken_file_is_an_error() {
        let path =
            std::env::temp_dir().join(format!("rdc-client-broken-{}.toml", std::process::id()));
        std::fs::write(&path, "[session\nhost = ").unwrap();
        assert!(ClientConfig::load(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
