//! Configuration management for tenantseal

use crate::crypto::{DerivationParams, PBKDF2_ITERATIONS};
use crate::document::DEFAULT_MAX_DOCUMENT_BYTES;
use crate::error::{Error, Result};
use crate::rotation::RotationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default rotation batch size
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Key derivation algorithm selection for newly provisioned versions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    Pbkdf2Sha256,
    Argon2id,
}

/// Key derivation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfConfig {
    /// Algorithm used for newly registered key versions
    pub algorithm: KdfAlgorithm,

    /// PBKDF2 iteration count
    pub pbkdf2_iterations: u32,

    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        KdfConfig {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            pbkdf2_iterations: PBKDF2_ITERATIONS,
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
        }
    }
}

impl KdfConfig {
    /// Parameter set for newly registered key versions
    pub fn derivation_params(&self) -> DerivationParams {
        match self.algorithm {
            KdfAlgorithm::Pbkdf2Sha256 => DerivationParams::Pbkdf2Sha256 {
                iterations: self.pbkdf2_iterations,
            },
            KdfAlgorithm::Argon2id => DerivationParams::Argon2id {
                memory_kib: self.argon2_memory_kib,
                iterations: self.argon2_iterations,
                parallelism: self.argon2_parallelism,
            },
        }
    }
}

/// Document encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Upper bound on document plaintext size in bytes
    pub max_document_bytes: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        DocumentConfig {
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Key derivation configuration
    #[serde(default)]
    pub kdf: KdfConfig,

    /// Document encryption configuration
    #[serde(default)]
    pub documents: DocumentConfig,

    /// Rotation configuration
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory (key material, jobs, records)
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tenantseal");

        Config {
            kdf: KdfConfig::default(),
            documents: DocumentConfig::default(),
            rotation: RotationConfig::default(),
            logging: LoggingConfig::default(),
            data_dir,
        }
    }
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment
    /// variable substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let content = Self::substitute_env_vars(&content);

        // Detect format by extension
        let ext = path_ref.extension().and_then(|s| s.to_str());
        let mut config: Config = if ext == Some("yaml") || ext == Some("yml") {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Substitute environment variables in config content.
    /// Supports ${VAR_NAME} syntax.
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_name = &cap[1];

            if let Ok(value) = std::env::var(var_name) {
                result = result.replace(full_match, &value);
            }
        }

        result
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("TENANTSEAL_DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(size) = std::env::var("TENANTSEAL_BATCH_SIZE") {
            if let Ok(size) = size.trim().parse::<usize>() {
                self.rotation.batch_size = size;
            }
        }

        if let Ok(limit) = std::env::var("TENANTSEAL_MAX_DOCUMENT_BYTES") {
            if let Ok(limit) = limit.trim().parse::<usize>() {
                self.documents.max_document_bytes = limit;
            }
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let ext = path_ref.extension().and_then(|s| s.to_str());
        let content = if ext == Some("yaml") || ext == Some("yml") {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to YAML: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to JSON: {}", e)))?
        };

        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.rotation.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "Rotation batch size must be greater than 0".to_string(),
            ));
        }

        if self.documents.max_document_bytes == 0 {
            return Err(Error::InvalidConfig(
                "Document size limit must be greater than 0".to_string(),
            ));
        }

        // Slow derivation is the point; refuse configurations that gut it
        if self.kdf.pbkdf2_iterations < 10_000 {
            return Err(Error::InvalidConfig(
                "PBKDF2 iteration count must be at least 10000".to_string(),
            ));
        }

        if self.kdf.argon2_iterations == 0 || self.kdf.argon2_parallelism == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 iterations and parallelism must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Sled database paths under the data directory
    pub fn key_store_path(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn job_store_path(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn record_store_path(&self) -> PathBuf {
        self.data_dir.join("records")
    }
}
