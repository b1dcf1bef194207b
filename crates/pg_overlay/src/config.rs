//! Connection settings for the source ("lower") and overlay ("upper") roles.

use crate::error::ConfigError;

/// Environment prefix for the source database connection.
pub const SOURCE_ENV_PREFIX: &str = "LOWER";
/// Environment prefix for the overlay database connection.
pub const OVERLAY_ENV_PREFIX: &str = "UPPER";

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_POOL_SIZE: usize = 10;

/// Schemas never overlaid.
pub const DEFAULT_EXCLUDED_SCHEMAS: [&str; 2] = ["pg_catalog", "information_schema"];

/// One PostgreSQL role's connection options.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub user: String,
    pub host: String,
    pub database: String,
    pub password: String,
    pub port: u16,
    /// Number of connections opened for this role.
    pub max: usize,
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("database", &self.database)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("max", &self.max)
            .finish()
    }
}

impl ConnectionOptions {
    /// Reads `{PREFIX}_USER`, `{PREFIX}_HOST`, `{PREFIX}_DATABASE`,
    /// `{PREFIX}_PASSWORD`, `{PREFIX}_PORT` and `{PREFIX}_MAX` from the process
    /// environment.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary key/value source.
    ///
    /// Empty values are treated as absent.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            let key = env_key(prefix, name);
            let value = lookup(&key).filter(|value| !value.is_empty());
            (key, value)
        };
        let required = |name: &str| match read(name) {
            (_, Some(value)) => Ok(value),
            (key, None) => Err(ConfigError::Missing { key }),
        };

        let user = required("user")?;
        let host = required("host")?;
        let database = required("database")?;
        let password = required("password")?;
        let (port_key, port) = read("port");
        let port = parse_port(&port_key, port, DEFAULT_PORT)?;
        let (max_key, max) = read("max");
        let max = parse_usize(&max_key, max, DEFAULT_POOL_SIZE)?.max(1);

        Ok(Self {
            user,
            host,
            database,
            password,
            port,
            max,
        })
    }

    /// `tokio-postgres` configuration for these options.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .user(&self.user)
            .password(&self.password)
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .application_name("pg_overlay");
        config
    }
}

/// Everything one setup run needs, built once and passed by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    pub source: ConnectionOptions,
    pub overlay: ConnectionOptions,
    /// Source schemas skipped during discovery.
    pub excluded_schemas: Vec<String>,
}

impl OverlayConfig {
    pub fn new(source: ConnectionOptions, overlay: ConnectionOptions) -> Self {
        Self {
            source,
            overlay,
            excluded_schemas: DEFAULT_EXCLUDED_SCHEMAS
                .iter()
                .map(|schema| schema.to_string())
                .collect(),
        }
    }

    /// Loads both connection sets from `LOWER_*` and `UPPER_*`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(
            ConnectionOptions::from_env(SOURCE_ENV_PREFIX)?,
            ConnectionOptions::from_env(OVERLAY_ENV_PREFIX)?,
        ))
    }

    /// Adds schemas to the discovery exclusion list.
    pub fn with_excluded_schemas<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for schema in schemas {
            let schema = schema.into();
            if !self.excluded_schemas.contains(&schema) {
                self.excluded_schemas.push(schema);
            }
        }
        self
    }
}

fn env_key(prefix: &str, name: &str) -> String {
    format!("{prefix}_{name}").to_ascii_uppercase()
}

/// Parses an optional port override with fallback default.
fn parse_port(key: &str, value: Option<String>, default_port: u16) -> Result<u16, ConfigError> {
    match value {
        Some(raw) => raw.trim().parse::<u16>().map_err(|err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        }),
        None => Ok(default_port),
    }
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(key: &str, value: Option<String>, default_value: usize) -> Result<usize, ConfigError> {
    match value {
        Some(raw) => raw.trim().parse::<usize>().map_err(|err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        }),
        None => Ok(default_value),
    }
}
