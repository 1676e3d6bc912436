use std::{env, fmt, net::SocketAddr, time::Duration};

use url::Url;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://hcm.db?mode=rwc";
pub const DEFAULT_SEARCH_MAX_LIMIT: u32 = 1000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Base URLs of the external collaborators. `None` means not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollaboratorUrls {
    pub idgen: Option<Url>,
    pub project: Option<Url>,
    pub facility: Option<Url>,
    pub boundary: Option<Url>,
    pub user: Option<Url>,
    pub id_pool: Option<Url>,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub collaborators: CollaboratorUrls,
    pub beneficiary_id_validation: bool,
    /// `false` skips the row-version check on delete.
    pub enforce_delete_row_version: bool,
    pub search_max_limit: u32,
    pub cache_ttl: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let collaborators = CollaboratorUrls {
            idgen: optional_url("IDGEN_BASE_URL")?,
            project: optional_url("PROJECT_SERVICE_URL")?,
            facility: optional_url("FACILITY_SERVICE_URL")?,
            boundary: optional_url("BOUNDARY_SERVICE_URL")?,
            user: optional_url("USER_SERVICE_URL")?,
            id_pool: optional_url("IDPOOL_BASE_URL")?,
        };

        let beneficiary_id_validation = flag("BENEFICIARY_ID_VALIDATION_ENABLED", false)?;
        if beneficiary_id_validation && collaborators.id_pool.is_none() {
            return Err(ConfigError::MissingIdPoolUrl);
        }

        let enforce_delete_row_version = match non_empty_var("DELETE_ROW_VERSION_CHECK") {
            None => true,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "enforce" => true,
                "skip" => false,
                _ => return Err(ConfigError::InvalidRowVersionCheck(value)),
            },
        };

        let search_max_limit = number("SEARCH_MAX_LIMIT", DEFAULT_SEARCH_MAX_LIMIT)?;
        if search_max_limit == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "SEARCH_MAX_LIMIT",
                value: "0".to_string(),
            });
        }
        let cache_ttl = Duration::from_secs(number("CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?);

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            collaborators,
            beneficiary_id_validation,
            enforce_delete_row_version,
            search_max_limit,
            cache_ttl,
        })
    }
}

fn non_empty_var(var: &'static str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// Base URLs always end with `/` so relative paths join below them.
fn optional_url(var: &'static str) -> Result<Option<Url>, ConfigError> {
    let Some(mut value) = non_empty_var(var) else {
        return Ok(None);
    };
    if !value.ends_with('/') {
        value.push('/');
    }
    Url::parse(&value)
        .map(Some)
        .map_err(|err| ConfigError::InvalidUrl { var, source: err })
}

fn flag(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match non_empty_var(var) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidFlag { var, value }),
        },
    }
}

fn number<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(var) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
    InvalidFlag {
        var: &'static str,
        value: String,
    },
    InvalidNumber {
        var: &'static str,
        value: String,
    },
    InvalidRowVersionCheck(String),
    MissingIdPoolUrl,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidUrl { var, source } => write!(f, "invalid {var} value: {source}"),
            Self::InvalidFlag { var, value } => {
                write!(f, "{var} must be 'true' or 'false' (got {value})")
            }
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a positive integer (got {value})")
            }
            Self::InvalidRowVersionCheck(value) => write!(
                f,
                "DELETE_ROW_VERSION_CHECK must be 'enforce' or 'skip' (got {value})"
            ),
            Self::MissingIdPoolUrl => write!(
                f,
                "BENEFICIARY_ID_VALIDATION_ENABLED requires IDPOOL_BASE_URL"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
