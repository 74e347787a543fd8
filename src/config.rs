use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::generator::{Alphabet, GeneratorOptions};

const DEFAULT_CONFIG_PATH: &str = "config/default.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Unsupported store type: {0:?}")]
    UnsupportedStore(String),
    #[error("Store #{index} ({store_type}) is missing required field {field}")]
    MissingField {
        index: usize,
        store_type: String,
        field: &'static str,
    },
    #[error("Credentials error: {0}")]
    Credentials(String),
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Identifier length in characters
    pub hash_length: usize,
    #[serde(default)]
    pub hash_alphabet: Alphabet,
    /// Verified identifiers kept ready ahead of demand
    #[serde(default = "default_hash_buffer_size")]
    pub hash_buffer_size: usize,
    pub stores: Vec<StoreConfig>,
}

/// One entry of the `Stores` list. Which fields are required depends on
/// `Type`; the factory checks them when building the store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoreConfig {
    #[serde(rename = "Type")]
    pub store_type: String,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub store_root: String,
    #[serde(default)]
    pub name_path_regex: String,
    #[serde(default)]
    pub name_path_map: String,
    /// AWS region (s3)
    #[serde(default)]
    pub region: Option<String>,
    /// API endpoint override for S3-compatible services or emulators
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Service account JSON key (gcs); metadata server credentials when absent
    #[serde(default)]
    pub key_file: Option<String>,
    /// GCP project id (gcs), informational
    #[serde(default, rename = "AppID")]
    pub app_id: Option<String>,
    /// Seconds allowed to establish a connection (s3, gcs)
    #[serde(default)]
    pub connect_timeout: Option<u64>,
    /// Seconds allowed for a whole backend request (s3, gcs)
    #[serde(default)]
    pub request_timeout: Option<u64>,
}

fn default_hash_buffer_size() -> usize {
    16
}

impl Config {
    /// Load configuration from the file named by `IMAGE_STORE_CONFIG`,
    /// applying environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("IMAGE_STORE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// `HASH_LENGTH` overrides `HashLength`. Bucket overrides are resolved
    /// per store by the factory.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("HASH_LENGTH") {
            self.hash_length = value.trim().parse().map_err(|_| {
                ConfigError::Validation(format!(
                    "HASH_LENGTH must be a positive integer, got {value:?}"
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hash_length == 0 {
            return Err(ConfigError::Validation(
                "HashLength must be greater than zero".to_string(),
            ));
        }

        if self.hash_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "HashBufferSize must be greater than zero".to_string(),
            ));
        }

        if self.stores.is_empty() {
            return Err(ConfigError::Validation(
                "At least one store must be configured".to_string(),
            ));
        }

        if self.hash_length < 6 && self.hash_alphabet == Alphabet::Hex {
            tracing::warn!(
                hash_length = self.hash_length,
                "Short hex identifiers exhaust quickly; generation slows as the store fills"
            );
        }

        Ok(())
    }

    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            length: self.hash_length,
            alphabet: self.hash_alphabet,
            buffer_size: self.hash_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "HashLength": 7,
        "Stores": [
            {
                "Type": "s3",
                "BucketName": "images",
                "Region": "us-east-1",
                "StoreRoot": "i",
                "NamePathRegex": "^(.)(.)(.*)$",
                "NamePathMap": "${1}/${2}/${1}${2}${3}"
            },
            {
                "Type": "gcs",
                "BucketName": "images-backup",
                "KeyFile": "/etc/keys/gcs.json",
                "AppID": "my-project",
                "ConnectTimeout": 2,
                "RequestTimeout": 15
            },
            { "Type": "local", "StoreRoot": "/var/images" }
        ]
    }"#;

    #[test]
    fn test_parses_store_entries() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.hash_length, 7);
        assert_eq!(config.hash_alphabet, Alphabet::Base62);
        assert_eq!(config.hash_buffer_size, 16);
        assert_eq!(config.stores.len(), 3);

        let s3 = &config.stores[0];
        assert_eq!(s3.store_type, "s3");
        assert_eq!(s3.bucket_name.as_deref(), Some("images"));
        assert_eq!(s3.region.as_deref(), Some("us-east-1"));
        assert_eq!(s3.name_path_map, "${1}/${2}/${1}${2}${3}");

        let gcs = &config.stores[1];
        assert_eq!(gcs.key_file.as_deref(), Some("/etc/keys/gcs.json"));
        assert_eq!(gcs.app_id.as_deref(), Some("my-project"));
        assert_eq!(gcs.store_root, "");
        assert_eq!(gcs.connect_timeout, Some(2));
        assert_eq!(gcs.request_timeout, Some(15));
        assert_eq!(s3.request_timeout, None);

        assert_eq!(config.stores[2].store_root, "/var/images");
        config.validate().unwrap();
    }

    #[test]
    fn test_alphabet_and_buffer() {
        let config = Config::from_json(
            r#"{"HashLength": 10, "HashAlphabet": "hex", "HashBufferSize": 4, "Stores": [{"Type": "local", "StoreRoot": "/tmp/x"}]}"#,
        )
        .unwrap();
        let options = config.generator_options();
        assert_eq!(options.length, 10);
        assert_eq!(options.alphabet, Alphabet::Hex);
        assert_eq!(options.buffer_size, 4);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::from_json(SAMPLE).unwrap();
        config.hash_length = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::from_json(SAMPLE).unwrap();
        config.hash_buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::from_json(SAMPLE).unwrap();
        config.stores.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_hash_length_override() {
        let mut config = Config::from_json(SAMPLE).unwrap();
        config
            .apply_env_overrides(|key| (key == "HASH_LENGTH").then(|| "12".to_string()))
            .unwrap();
        assert_eq!(config.hash_length, 12);

        let err = config
            .apply_env_overrides(|_| Some("twelve".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_parse_and_io_errors() {
        assert!(matches!(
            Config::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_file("/definitely/not/here.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(Config::from_file(&path).unwrap().stores.len(), 3);
    }
}
