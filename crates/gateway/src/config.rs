//! Engine configuration loading.
//!
//! A root `config.json` is deep-merged over the built-in defaults, then each
//! per-section overlay file in the extras folder replaces its top-level
//! subtree. The typed model and post-load fix-ups live in `bolt_contracts`.

use std::path::{Path, PathBuf};

use bolt_contracts::config::{merge_section, Config};
use serde_json::Value;

/// Sections that may be overridden by an individual overlay file.
const OVERLAY_SECTIONS: [&str; 7] = [
    "apiCalls",
    "cache",
    "commandMeta",
    "engine",
    "logging",
    "security",
    "workerConfig",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

/// Builds the engine config from `<config_dir>/config.json` plus any
/// per-section overlays in the configured extras folder. Falls back to the
/// repo-local `etc/bolt/config.json` when the configured file is missing.
pub fn load(config_dir: &Path) -> Result<(Config, PathBuf), StartupError> {
    let mut config_path = config_dir.join("config.json");
    let raw = match std::fs::read_to_string(&config_path) {
        Ok(raw) => raw,
        Err(_) => {
            config_path = PathBuf::from("etc/bolt/config.json");
            std::fs::read_to_string(&config_path).map_err(|_| StartupError {
                code: "ERR_CONFIG_READ",
                message: format!(
                    "failed to read config file at {} or {}",
                    config_dir.join("config.json").display(),
                    config_path.display(),
                ),
            })?
        }
    };

    let custom: Value = serde_json::from_str(&raw).map_err(|err| StartupError {
        code: "ERR_CONFIG_PARSE",
        message: format!("{err} in {}", config_path.display()),
    })?;

    let config = from_overlaid_value(custom)?;
    Ok((config, config_path))
}

/// Merges a custom root document over the defaults and applies the overlay
/// files it points at.
pub fn from_overlaid_value(custom: Value) -> Result<Config, StartupError> {
    let mut merged = serde_json::to_value(Config::default()).map_err(|err| StartupError {
        code: "ERR_CONFIG_PARSE",
        message: err.to_string(),
    })?;
    deep_merge(&mut merged, custom);

    // The extras folder only honors the root config's setting, so resolve it
    // before applying overlays.
    let extras = merged
        .get("engine")
        .and_then(|e| e.get("extraConfigFolder"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    if !extras.is_empty() {
        let extras_dir = PathBuf::from(&extras);
        for section in OVERLAY_SECTIONS {
            let path = extras_dir.join(format!("{section}.json"));
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let overlay: Value = serde_json::from_str(&raw).map_err(|err| StartupError {
                code: "ERR_CONFIG_PARSE",
                message: format!("{err} in {}", path.display()),
            })?;
            merge_section(&mut merged, section, overlay);
        }
    }

    Config::from_value(merged).map_err(|err| StartupError {
        code: err.code,
        message: err.message,
    })
}

/// Recursive object merge: overlay values win, objects merge key-wise,
/// arrays and scalars replace.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn custom_root_overrides_defaults_field_wise() {
        let config = from_overlaid_value(json!({
            "engine": {
                "bind": ":8294",
                "authMode": "simple",
                "tlsEnabled": false,
                "extraConfigFolder": "",
            }
        }))
        .expect("config should build");

        assert_eq!(config.engine.bind, ":8294");
        assert_eq!(config.engine.auth_mode, "simple");
        // Untouched defaults survive the merge.
        assert_eq!(config.engine.advanced.read_timeout, "30s");
        assert_eq!(config.security.verify_timeout, 30);
    }

    #[test]
    fn invalid_root_json_fails_with_parse_error() {
        let dir = std::env::temp_dir().join(format!("bolt-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        std::fs::write(dir.join("config.json"), "{not json").expect("write config");

        let err = load(&dir).unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG_PARSE");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_config_file_fails_with_read_error() {
        let err = load(Path::new("/nonexistent/bolt")).unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG_READ");
    }

    #[test]
    fn deep_merge_replaces_arrays_and_merges_objects() {
        let mut base = json!({
            "security": {"corsDomains": ["https://a"], "verifyTimeout": 30},
        });
        deep_merge(
            &mut base,
            json!({"security": {"corsDomains": ["https://b"]}}),
        );
        assert_eq!(base["security"]["corsDomains"], json!(["https://b"]));
        assert_eq!(base["security"]["verifyTimeout"], json!(30));
    }
}
