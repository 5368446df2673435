/// Engine configuration: KEM security level, module locations, retry policy.

use crate::error::{FileCryptError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Shared secret size, identical for every ML-KEM parameter set
pub const SHARED_SECRET_BYTES: usize = 32;

// ─── Security levels ─────────────────────────────────────────────────────────

/// NIST security category of the KEM parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// ML-KEM-512 (Kyber512)
    Level1,
    /// ML-KEM-768 (Kyber768), the reference level
    #[default]
    Level3,
    /// ML-KEM-1024 (Kyber1024)
    Level5,
}

/// Byte sizes of every buffer crossing the module boundary for one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KemParams {
    pub level: SecurityLevel,
    pub public_key_bytes: usize,
    pub secret_key_bytes: usize,
    pub ciphertext_bytes: usize,
    pub shared_secret_bytes: usize,
}

impl SecurityLevel {
    pub const fn params(self) -> KemParams {
        let (public_key_bytes, secret_key_bytes, ciphertext_bytes) = match self {
            SecurityLevel::Level1 => (800, 1632, 768),
            SecurityLevel::Level3 => (1184, 2400, 1088),
            SecurityLevel::Level5 => (1568, 3168, 1568),
        };
        KemParams {
            level: self,
            public_key_bytes,
            secret_key_bytes,
            ciphertext_bytes,
            shared_secret_bytes: SHARED_SECRET_BYTES,
        }
    }

    /// Algorithm name as it appears in module manifests and logs
    pub fn algorithm(self) -> &'static str {
        match self {
            SecurityLevel::Level1 => "ML-KEM-512",
            SecurityLevel::Level3 => "ML-KEM-768",
            SecurityLevel::Level5 => "ML-KEM-1024",
        }
    }
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.algorithm())
    }
}

// ─── Engine configuration ────────────────────────────────────────────────────

/// Location scheme resolved by `DefaultModuleSource` to the in-crate manifest.
pub const BUILTIN_SCHEME: &str = "builtin:";

/// Configuration for module loading and the readiness policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// KEM parameter set the module must implement.
    pub security_level: SecurityLevel,
    /// Ordered fallback list of module payload locations.
    pub module_locations: Vec<String>,
    /// Directory relative locations are resolved against.
    pub module_root: PathBuf,
    /// Upper bound on waiting for the runtime-ready callback, per attempt.
    pub init_timeout_ms: u64,
    /// Initialization attempt ceiling.
    pub max_init_attempts: u32,
    /// Pause between failed attempts.
    pub retry_delay_ms: u64,
    /// How long KEM operations wait for a module that is still initializing.
    pub ready_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Level3,
            module_locations: vec![
                "static/kem/ml-kem.json".to_string(),
                "ml-kem.json".to_string(),
                "./static/kem/ml-kem.json".to_string(),
                format!("{}ml-kem", BUILTIN_SCHEME),
            ],
            module_root: PathBuf::from("."),
            init_timeout_ms: 5_000,
            max_init_attempts: 3,
            retry_delay_ms: 1_000,
            ready_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| FileCryptError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.module_locations.is_empty() {
            return Err(FileCryptError::InvalidConfig(
                "module_locations must not be empty".into(),
            ));
        }
        if self.max_init_attempts == 0 {
            return Err(FileCryptError::InvalidConfig(
                "max_init_attempts must be at least 1".into(),
            ));
        }
        if self.init_timeout_ms == 0 {
            return Err(FileCryptError::InvalidConfig(
                "init_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn params(&self) -> KemParams {
        self.security_level.params()
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_level_sizes() {
        let params = SecurityLevel::default().params();
        assert_eq!(params.public_key_bytes, 1184);
        assert_eq!(params.secret_key_bytes, 2400);
        assert_eq!(params.ciphertext_bytes, 1088);
        assert_eq!(params.shared_secret_bytes, 32);
    }

    #[test]
    fn test_default_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.init_timeout(), Duration::from_millis(5000));
        assert_eq!(config.max_init_attempts, 3);
        assert_eq!(config.retry_delay(), Duration::from_millis(1000));
        assert!(config.module_locations.last().unwrap().starts_with(BUILTIN_SCHEME));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            EngineConfig::from_json(r#"{"security_level":"level5","retry_delay_ms":10}"#).unwrap();
        assert_eq!(config.security_level, SecurityLevel::Level5);
        assert_eq!(config.retry_delay_ms, 10);
        assert_eq!(config.max_init_attempts, 3);
        assert_eq!(config.params().ciphertext_bytes, 1568);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = EngineConfig::from_json(r#"{"max_init_attempts":0}"#).unwrap_err();
        assert!(matches!(err, FileCryptError::InvalidConfig(_)));

        let err = EngineConfig::from_json(r#"{"module_locations":[]}"#).unwrap_err();
        assert!(matches!(err, FileCryptError::InvalidConfig(_)));

        let err = EngineConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, FileCryptError::InvalidConfig(_)));
    }
}
