use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Load configuration from file with environment variable overrides.
///
/// Environment keys use a double underscore as the section separator so
/// that field names containing underscores survive, e.g.
/// `CELLAR_SELECTION__MIN_AGE_DAYS=30`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("CELLAR_").split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"
[torrent_client]
backend = "qbittorrent"

[torrent_client.qbittorrent]
url = "http://localhost:8080"
username = "admin"
password = "adminadmin"

[mountpoints]
source_media = "/data/media"
destination_media = "/archive/media"
destination_torrents = "/archive/torrents"

[selection]
min_age_days = 30
"#;

    #[test]
    fn test_load_config_from_str_valid() {
        let config = load_config_from_str(VALID).unwrap();
        assert_eq!(config.selection.min_age_days, 30);
    }

    #[test]
    fn test_load_config_from_str_missing_torrent_client() {
        let toml = r#"
[mountpoints]
source_media = "/data/media"
destination_media = "/archive/media"
destination_torrents = "/archive/torrents"
"#;
        let result = load_config_from_str(toml);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "{}", VALID).unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.selection.min_age_days, 30);
        assert_eq!(
            config.mountpoints.destination_torrents.to_str().unwrap(),
            "/archive/torrents"
        );
    }
}
