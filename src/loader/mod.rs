//! # Settings Loader
//!
//! Reads [`TestSettings`] from a JSON file. Every field is optional; missing
//! ones take their defaults, and `WEBPROBE_*` environment variables are
//! applied on top so a CI job can override a checked-in file.
//!
//! ```ignore
//! let settings = load_settings_from_file("./checks/homepage.json")?;
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::config::TestSettings;
use crate::errors::ErrorCode;

/// Loads settings from `path`, then applies environment overrides.
pub fn load_settings_from_file<P: AsRef<Path>>(path: P) -> Result<TestSettings> {
    load_settings_with_env(path, |key| std::env::var(key).ok())
}

/// Same as [`load_settings_from_file`] with an explicit environment lookup.
pub fn load_settings_with_env<P: AsRef<Path>>(
    path: P,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<TestSettings> {
    let path_ref = path.as_ref();

    let content = fs::read_to_string(path_ref)
        .with_context(|| format!("[{}] Failed to read settings file {:?}", ErrorCode::SETTINGS_FILE_ERROR, path_ref))?;

    let mut settings: TestSettings = serde_json::from_str(&content)
        .with_context(|| format!("[{}] Failed to parse settings JSON {:?}", ErrorCode::SETTINGS_FILE_ERROR, path_ref))?;

    settings.apply_env(lookup);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_temp(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("webprobe-{}-{}.json", name, uuid::Uuid::new_v4()));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let path = write_temp(
            "partial",
            r#"{ "max_redirections": 3, "request": { "method": "HEAD" } }"#,
        );
        let settings = load_settings_with_env(&path, |_| None).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(settings.max_redirections, 3);
        assert_eq!(settings.request.method, "HEAD");
        assert!(settings.follow_redirects);
        assert_eq!(settings.request_timeout_ms, TestSettings::default().request_timeout_ms);
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = write_temp("env", r#"{ "follow_redirects": true }"#);
        let settings = load_settings_with_env(&path, |key| {
            (key == "WEBPROBE_FOLLOW_REDIRECTS").then(|| "false".to_string())
        })
        .unwrap();
        fs::remove_file(&path).ok();

        assert!(!settings.follow_redirects);
    }

    #[test]
    fn test_missing_file_and_bad_json() {
        let err = load_settings_from_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read settings file"));
        assert!(err.to_string().starts_with("[E4001]"));

        let path = write_temp("bad", "{ not json");
        let err = load_settings_with_env(&path, |_| None).unwrap_err();
        fs::remove_file(&path).ok();
        assert!(err.to_string().contains("Failed to parse settings JSON"));
        assert!(err.to_string().starts_with("[E4001]"));
    }
}
