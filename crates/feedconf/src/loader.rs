//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, FeedConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli). Only existing
/// files are returned.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/midifeed/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("midifeed/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("midifeed.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and overlay the keys it sets onto `config`.
pub fn overlay_file(config: &mut FeedConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    overlay_toml(config, &contents, path)
}

/// Overlay the keys present in a TOML document; absent keys keep their
/// current value so that later files only override what they mention.
fn overlay_toml(config: &mut FeedConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let bad_value = |key: &str| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("invalid value for {}", key),
    };

    if let Some(v) = table.get("verbose") {
        config.verbose = v.as_bool().ok_or_else(|| bad_value("verbose"))?;
    }

    if let Some(device) = table.get("device").and_then(|v| v.as_table()) {
        if let Some(keywords) = device.get("keywords").and_then(|v| v.as_array()) {
            config.device.keywords = keywords
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = device.get("retry_ms") {
            let ms = v.as_integer().ok_or_else(|| bad_value("device.retry_ms"))?;
            config.device.retry_ms = u64::try_from(ms).map_err(|_| bad_value("device.retry_ms"))?;
        }
    }

    if let Some(normalize) = table.get("normalize").and_then(|v| v.as_table()) {
        if let Some(v) = normalize.get("hold_threshold_s") {
            // Accept both `1` and `1.0`
            let secs = v
                .as_float()
                .or_else(|| v.as_integer().map(|i| i as f64))
                .ok_or_else(|| bad_value("normalize.hold_threshold_s"))?;
            if secs < 0.0 {
                return Err(bad_value("normalize.hold_threshold_s"));
            }
            config.normalize.hold_threshold_s = secs;
        }
    }

    if let Some(capture) = table.get("capture").and_then(|v| v.as_table()) {
        if let Some(v) = capture.get("prefix").and_then(|v| v.as_str()) {
            if !v.trim().is_empty() {
                config.capture.prefix = v.trim().to_string();
            }
        }
        if let Some(v) = capture.get("dir").and_then(|v| v.as_str()) {
            config.capture.dir = expand_path(v);
        }
        if let Some(v) = capture.get("capture_all") {
            config.capture.capture_all =
                v.as_bool().ok_or_else(|| bad_value("capture.capture_all"))?;
        }
    }

    if let Some(server) = table.get("server").and_then(|v| v.as_table()) {
        if let Some(v) = server.get("bind").and_then(|v| v.as_str()) {
            config.server.bind = v.to_string();
        }
        if let Some(v) = server.get("port") {
            let port = v.as_integer().ok_or_else(|| bad_value("server.port"))?;
            config.server.port = u16::try_from(port).map_err(|_| bad_value("server.port"))?;
        }
        if let Some(v) = server.get("keep_alive_secs") {
            let secs = v.as_integer().ok_or_else(|| bad_value("server.keep_alive_secs"))?;
            config.server.keep_alive_secs =
                u64::try_from(secs).map_err(|_| bad_value("server.keep_alive_secs"))?;
        }
        if let Some(v) = server.get("queue_capacity") {
            let capacity = v.as_integer().ok_or_else(|| bad_value("server.queue_capacity"))?;
            config.server.queue_capacity = usize::try_from(capacity)
                .ok()
                .filter(|c| *c > 0)
                .ok_or_else(|| bad_value("server.queue_capacity"))?;
        }
        if let Some(v) = server.get("include_all") {
            config.server.include_all = v.as_bool().ok_or_else(|| bad_value("server.include_all"))?;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.telemetry.log_level = v.to_string();
        }
        if let Some(v) = telemetry.get("otlp_endpoint").and_then(|v| v.as_str()) {
            config.telemetry.otlp_endpoint = Some(v.to_string()).filter(|s| !s.is_empty());
        }
    }

    Ok(())
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut FeedConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, env::vars());
}

/// Apply overrides from an explicit set of variables.
///
/// Unparsable numeric values are ignored rather than rejected.
pub fn apply_overrides_from<I>(config: &mut FeedConfig, sources: &mut ConfigSources, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut log_level = None;
    let mut rust_log = None;

    for (key, value) in vars {
        let applied = match key.as_str() {
            "MIDIFEED_PORT" => value.parse::<u16>().map(|p| config.server.port = p).is_ok(),
            "MIDIFEED_BIND" => {
                config.server.bind = value;
                true
            }
            "MIDIFEED_HOLD_THRESHOLD" => value
                .parse::<f64>()
                .ok()
                .filter(|s| *s >= 0.0)
                .map(|s| config.normalize.hold_threshold_s = s)
                .is_some(),
            "MIDIFEED_CAPTURE_PREFIX" if !value.trim().is_empty() => {
                config.capture.prefix = value.trim().to_string();
                true
            }
            "MIDIFEED_CAPTURE_DIR" => {
                config.capture.dir = expand_path(&value);
                true
            }
            "MIDIFEED_DEVICE" => {
                config.device.keywords = vec![value];
                true
            }
            // Both set the log level; applied after the loop in a fixed order
            "MIDIFEED_LOG_LEVEL" => {
                log_level = Some(value);
                false
            }
            "RUST_LOG" => {
                rust_log = Some(value);
                false
            }
            "MIDIFEED_OTLP_ENDPOINT" => {
                config.telemetry.otlp_endpoint = Some(value).filter(|s| !s.is_empty());
                true
            }
            _ => false,
        };

        if applied {
            sources.env_overrides.push(key);
        }
    }

    // RUST_LOG wins when both are set
    if let Some(v) = log_level {
        config.telemetry.log_level = v;
        sources.env_overrides.push("MIDIFEED_LOG_LEVEL".to_string());
    }
    if let Some(v) = rust_log {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        let (var_name, rest) = match stripped.find('/') {
            Some(pos) => (&stripped[..pos], Some(&stripped[pos + 1..])),
            None => (stripped, None),
        };
        if let Ok(var_value) = env::var(var_name) {
            let base = PathBuf::from(var_value);
            return match rest {
                Some(rest) => base.join(rest),
                None => base,
            };
        }
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_overlay_minimal_toml() {
        let mut config = FeedConfig::default();
        overlay_toml(&mut config, "[server]\nport = 9000\n", Path::new("test.toml")).unwrap();

        assert_eq!(config.server.port, 9000);
        // Untouched keys keep their defaults
        assert_eq!(config.server.keep_alive_secs, 15);
        assert_eq!(config.capture.prefix, "midi_capture");
    }

    #[test]
    fn test_overlay_full_toml() {
        let toml = r#"
verbose = true

[device]
keywords = ["Digital Piano"]
retry_ms = 250

[normalize]
hold_threshold_s = 1

[capture]
prefix = "session"
dir = "/data/captures"
capture_all = true

[server]
bind = "127.0.0.1"
port = 9100
keep_alive_secs = 5
queue_capacity = 64
include_all = true

[telemetry]
log_level = "debug"
otlp_endpoint = "127.0.0.1:4317"
"#;
        let mut config = FeedConfig::default();
        overlay_toml(&mut config, toml, Path::new("test.toml")).unwrap();

        assert!(config.verbose);
        assert_eq!(config.device.keywords, vec!["Digital Piano"]);
        assert_eq!(config.device.retry_ms, 250);
        assert_eq!(config.normalize.hold_threshold_s, 1.0);
        assert_eq!(config.capture.prefix, "session");
        assert_eq!(config.capture.dir, PathBuf::from("/data/captures"));
        assert!(config.capture.capture_all);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.keep_alive_secs, 5);
        assert_eq!(config.server.queue_capacity, 64);
        assert!(config.server.include_all);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.telemetry.otlp_endpoint.as_deref(), Some("127.0.0.1:4317"));
    }

    #[test]
    fn test_later_file_only_overrides_what_it_sets() {
        let mut config = FeedConfig::default();
        overlay_toml(&mut config, "[server]\nport = 9000\n", Path::new("a.toml")).unwrap();
        overlay_toml(&mut config, "[capture]\nprefix = \"b\"\n", Path::new("b.toml")).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.capture.prefix, "b");
    }

    #[test]
    fn test_overlay_rejects_out_of_range_port() {
        let mut config = FeedConfig::default();
        let err = overlay_toml(&mut config, "[server]\nport = 70000\n", Path::new("bad.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_overlay_rejects_malformed_toml() {
        let mut config = FeedConfig::default();
        let err = overlay_toml(&mut config, "[server\nport = ", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = FeedConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(
            &mut config,
            &mut sources,
            vars(&[
                ("MIDIFEED_PORT", "9200"),
                ("MIDIFEED_HOLD_THRESHOLD", "0.25"),
                ("MIDIFEED_DEVICE", "Keystation"),
                ("UNRELATED", "x"),
            ]),
        );

        assert_eq!(config.server.port, 9200);
        assert_eq!(config.normalize.hold_threshold_s, 0.25);
        assert_eq!(config.device.keywords, vec!["Keystation"]);
        assert_eq!(
            sources.env_overrides,
            vec!["MIDIFEED_PORT", "MIDIFEED_HOLD_THRESHOLD", "MIDIFEED_DEVICE"]
        );
    }

    #[test]
    fn test_rust_log_wins_over_log_level() {
        for pairs in [
            [("MIDIFEED_LOG_LEVEL", "debug"), ("RUST_LOG", "warn")],
            [("RUST_LOG", "warn"), ("MIDIFEED_LOG_LEVEL", "debug")],
        ] {
            let mut config = FeedConfig::default();
            let mut sources = ConfigSources::default();
            apply_overrides_from(&mut config, &mut sources, vars(&pairs));

            assert_eq!(config.telemetry.log_level, "warn");
            assert_eq!(sources.env_overrides, vec!["MIDIFEED_LOG_LEVEL", "RUST_LOG"]);
        }
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let mut config = FeedConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(
            &mut config,
            &mut sources,
            vars(&[("MIDIFEED_PORT", "not-a-port"), ("MIDIFEED_HOLD_THRESHOLD", "-1")]),
        );

        assert_eq!(config.server.port, 8766);
        assert_eq!(config.normalize.hold_threshold_s, 0.6);
        assert!(sources.env_overrides.is_empty());
    }
}
