use super::SupervisorConfig;
use crate::process::{ProcessError, Result};
use std::path::Path;
use tokio::fs;

/// Load the supervisor config; `None` yields the defaults
pub async fn load_config(path: Option<&Path>) -> Result<SupervisorConfig> {
    let Some(path) = path else {
        return Ok(SupervisorConfig::default());
    };
    let content = fs::read_to_string(path).await.map_err(|e| {
        ProcessError::Config(format!("Cannot read config {}: {}", path.display(), e))
    })?;
    let config = parse_config(&content).map_err(|e| match e {
        ProcessError::Config(message) => {
            ProcessError::Config(format!("{}: {}", path.display(), message))
        }
        other => other,
    })?;
    tracing::debug!("Loaded supervisor config from {}", path.display());
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<SupervisorConfig> {
    let config: SupervisorConfig =
        toml::from_str(content).map_err(|e| ProcessError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_partial_config() {
        let config = parse_config("timeout = \"1m 30s\"\nstderr_level = \"warn\"\n").unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.stderr_level.as_deref(), Some("warn"));
        assert_eq!(config.console_buffer_lines, 100);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            parse_config("colour = true"),
            Err(ProcessError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "console_buffer_lines = 5\ncharset = \"latin1\"\n").unwrap();

        let config = load_config(Some(file.path())).await.unwrap();
        assert_eq!(config.console_buffer_lines, 5);
        assert_eq!(config.charset, "latin1");
    }

    #[tokio::test]
    async fn test_missing_path_yields_defaults_and_missing_file_fails() {
        assert_eq!(load_config(None).await.unwrap(), SupervisorConfig::default());
        assert!(load_config(Some(Path::new("/nonexistent/procwarden.toml")))
            .await
            .is_err());
    }
}
