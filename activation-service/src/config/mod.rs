use secrecy::SecretString;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

use crate::services::hasher::HashParams;

#[derive(Debug, Clone)]
pub struct ActivationConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageConfig,
    pub codes: CodePolicy,
    pub hashing: HashParams,
    pub rate_limit: RateLimitConfig,
    pub smtp: Option<SmtpConfig>,
    pub security: SecurityConfig,
    pub expiry_sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Issuance and lockout policy for activation codes.
#[derive(Debug, Clone)]
pub struct CodePolicy {
    pub default_ttl_hours: i64,
    pub min_ttl_hours: i64,
    pub max_ttl_hours: i64,
    pub max_attempts: i32,
    /// Whether extending a locked code may reset its counter and unlock it.
    pub allow_unlock_on_extend: bool,
}

impl Default for CodePolicy {
    fn default() -> Self {
        Self {
            default_ttl_hours: 72,
            min_ttl_hours: 1,
            max_ttl_hours: 720,
            max_attempts: 5,
            allow_unlock_on_extend: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub validate_ip_attempts: u32,
    pub validate_ip_window_seconds: u64,
    pub validate_identifier_attempts: u32,
    pub validate_identifier_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            validate_ip_attempts: 20,
            validate_ip_window_seconds: 900,
            validate_identifier_attempts: 10,
            validate_identifier_window_seconds: 900,
            global_ip_limit: 300,
            global_ip_window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub from_email: String,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "activation-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                database_url: None,
                max_connections: 10,
                min_connections: 1,
            },
            codes: CodePolicy::default(),
            hashing: HashParams::default(),
            rate_limit: RateLimitConfig::default(),
            smtp: None,
            security: SecurityConfig {
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            expiry_sweep_interval_seconds: 300,
        }
    }
}

impl ActivationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let environment: Environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "dev".to_string())
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;

        let defaults = ActivationConfig::default();
        let backend: StorageBackend = get_env(
            "STORAGE_BACKEND",
            Some(if is_prod { "postgres" } else { "memory" }),
            false,
        )?
        .parse()
        .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let needs_database = backend == StorageBackend::Postgres;

        let smtp = match env::var("SMTP_HOST") {
            Ok(host) if !host.is_empty() => Some(SmtpConfig {
                host,
                port: get_parsed("SMTP_PORT", "587")?,
                user: get_env("SMTP_USER", None, true)?,
                password: SecretString::new(get_env("SMTP_PASSWORD", None, true)?),
                from_email: get_env("SMTP_FROM_EMAIL", None, true)?,
            }),
            _ => None,
        };

        let config = ActivationConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("activation-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|e| !e.is_empty()),
            storage: StorageConfig {
                backend,
                database_url: if needs_database {
                    Some(get_env("DATABASE_URL", None, true)?)
                } else {
                    None
                },
                max_connections: get_parsed("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: get_parsed("DATABASE_MIN_CONNECTIONS", "1")?,
            },
            codes: CodePolicy {
                default_ttl_hours: get_parsed("CODE_DEFAULT_TTL_HOURS", "72")?,
                min_ttl_hours: get_parsed("CODE_MIN_TTL_HOURS", "1")?,
                max_ttl_hours: get_parsed("CODE_MAX_TTL_HOURS", "720")?,
                max_attempts: get_parsed("CODE_MAX_ATTEMPTS", "5")?,
                allow_unlock_on_extend: get_parsed("CODE_ALLOW_UNLOCK_ON_EXTEND", "false")?,
            },
            hashing: HashParams {
                memory_kib: get_parsed("HASH_MEMORY_KIB", &defaults.hashing.memory_kib.to_string())?,
                iterations: get_parsed("HASH_ITERATIONS", &defaults.hashing.iterations.to_string())?,
                parallelism: get_parsed("HASH_PARALLELISM", &defaults.hashing.parallelism.to_string())?,
            },
            rate_limit: RateLimitConfig {
                validate_ip_attempts: get_parsed("RATE_LIMIT_VALIDATE_IP_ATTEMPTS", "20")?,
                validate_ip_window_seconds: get_parsed("RATE_LIMIT_VALIDATE_IP_WINDOW_SECONDS", "900")?,
                validate_identifier_attempts: get_parsed(
                    "RATE_LIMIT_VALIDATE_IDENTIFIER_ATTEMPTS",
                    "10",
                )?,
                validate_identifier_window_seconds: get_parsed(
                    "RATE_LIMIT_VALIDATE_IDENTIFIER_WINDOW_SECONDS",
                    "900",
                )?,
                global_ip_limit: get_parsed("RATE_LIMIT_GLOBAL_IP_LIMIT", "300")?,
                global_ip_window_seconds: get_parsed("RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS", "60")?,
            },
            smtp,
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            expiry_sweep_interval_seconds: get_parsed("EXPIRY_SWEEP_INTERVAL_SECONDS", "300")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(config_error("PORT must be greater than 0"));
        }

        let codes = &self.codes;
        if codes.min_ttl_hours < 1 || codes.min_ttl_hours > codes.max_ttl_hours {
            return Err(config_error(
                "CODE_MIN_TTL_HOURS must be at least 1 and not exceed CODE_MAX_TTL_HOURS",
            ));
        }
        if codes.default_ttl_hours < codes.min_ttl_hours || codes.default_ttl_hours > codes.max_ttl_hours {
            return Err(config_error(
                "CODE_DEFAULT_TTL_HOURS must lie within [CODE_MIN_TTL_HOURS, CODE_MAX_TTL_HOURS]",
            ));
        }
        if codes.max_attempts < 1 {
            return Err(config_error("CODE_MAX_ATTEMPTS must be positive"));
        }
        if self.expiry_sweep_interval_seconds == 0 {
            return Err(config_error("EXPIRY_SWEEP_INTERVAL_SECONDS must be positive"));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(config_error("Wildcard CORS origin not allowed in production"));
            }
            if self.storage.backend == StorageBackend::Memory {
                tracing::error!("In-memory storage in production loses all codes on restart");
            }
            if self.hashing.memory_kib < HashParams::default().memory_kib {
                tracing::warn!(
                    memory_kib = self.hashing.memory_kib,
                    "Argon2 memory cost is below the recommended minimum"
                );
            }
        }

        Ok(())
    }
}

fn config_error(msg: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(msg.to_string()))
}

/// Read `key`, falling back to `default`. `required_in_prod` keys must be set explicitly
/// in production.
fn get_env(key: &str, default: Option<&str>, required_in_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            let is_prod = env::var("ENVIRONMENT")
                .map(|e| e.eq_ignore_ascii_case("prod"))
                .unwrap_or(false);
            if is_prod && required_in_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_parsed<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), false)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("Invalid {}: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ActivationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_policy() {
        let policy = CodePolicy::default();
        assert_eq!(policy.default_ttl_hours, 72);
        assert_eq!(policy.max_ttl_hours, 720);
        assert_eq!(policy.max_attempts, 5);
        assert!(!policy.allow_unlock_on_extend);
    }

    #[test]
    fn test_default_ttl_outside_bounds_rejected() {
        let mut config = ActivationConfig::default();
        config.codes.default_ttl_hours = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut config = ActivationConfig::default();
        config.codes.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_origin_rejected_in_prod() {
        let mut config = ActivationConfig::default();
        config.environment = Environment::Prod;
        config.security.allowed_origins = vec!["*".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Prod));
        assert_eq!("memory".parse::<StorageBackend>(), Ok(StorageBackend::Memory));
        assert!("mongo".parse::<StorageBackend>().is_err());
    }
}
