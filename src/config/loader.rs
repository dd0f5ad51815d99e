use std::path::{Path, PathBuf};

use crate::config::types::RunboxConfig;
use crate::error::{Result, RunboxError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runbox", "runbox") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".runbox").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<RunboxConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // An explicitly named file must exist; the default path may not.
        if config_path.is_some() {
            return Err(RunboxError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        return Ok(RunboxConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: RunboxConfig =
        toml::from_str(&content).map_err(|e| RunboxError::TomlParse(e.to_string()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_default_config_falls_back_to_defaults() {
        let config = load_config(None).unwrap();
        assert!(config.routes.is_empty());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/runbox.toml"))).unwrap_err();
        assert!(matches!(err, RunboxError::ConfigNotFound { .. }));
    }

    #[test]
    fn routes_are_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[execution]
isolation = "firejail"
allow_url_files = true

[routes.thumbnail]
input_files = ["in.png"]
output_files = ["out.png"]
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert!(config.execution.allow_url_files);
        assert!(config.routes.contains_key("thumbnail"));
    }
}
