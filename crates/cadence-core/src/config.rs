use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PG_PORT: u16 = 5432;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_INSTANCES: i32 = 16;
/// One chain transaction, its status writes, and the poll loop.
pub const MIN_STORE_CONNECTIONS: u32 = 3;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Connection settings for the configuration store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default = "default_user")]
    pub user: String,
    pub password: Option<String>,
    #[serde(default)]
    pub sslmode: SslMode,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PG_PORT,
            dbname: default_dbname(),
            user: default_user(),
            password: None,
            sslmode: SslMode::default(),
            max_connections: default_max_connections(),
        }
    }
}

/// libpq-compatible `sslmode` values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

/// How eligible chains of different configs are dispatched within one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// One task per chain; a long chain never delays the others.
    #[default]
    Concurrent,
    /// Chains run one after another inside the poll pass.
    Serial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identity used for the advisory lock and log attribution.
    #[serde(default)]
    pub client_name: String,
    /// Persist DEBUG/NOTICE/LOG rows too, not just ERROR/PANIC.
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
    /// Attempts for the initial store connection.
    #[serde(default = "default_retries")]
    pub connect_retries: u32,
    /// Attempts to re-establish a lost store connection.
    #[serde(default = "default_retries")]
    pub reconnect_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// How long shutdown waits for in-flight chains.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// 0 = exit when another instance holds the identity lock,
    /// otherwise retry every N seconds.
    #[serde(default)]
    pub lock_wait_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            client_name: String::new(),
            verbose: false,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            dispatch_mode: DispatchMode::default(),
            connect_retries: default_retries(),
            reconnect_retries: default_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            shutdown_grace_secs: default_shutdown_grace(),
            lock_wait_secs: 0,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PG_PORT
}
fn default_dbname() -> String {
    "timetable".to_string()
}
fn default_user() -> String {
    "scheduler".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_retries() -> u32 {
    10
}
fn default_retry_base_delay() -> u64 {
    500
}
fn default_retry_max_delay() -> u64 {
    30_000
}
fn default_shutdown_grace() -> u64 {
    30
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `CADENCE_SCHEDULER__CLIENT_NAME=worker-1` sets `scheduler.client_name`.
    /// A missing file is not an error; defaults and env vars still apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.scheduler.client_name.trim().is_empty() {
            return Err(crate::error::CadenceError::Config(
                "scheduler.client_name must not be empty".to_string(),
            ));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(crate::error::CadenceError::Config(
                "scheduler.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.database.max_connections < MIN_STORE_CONNECTIONS {
            return Err(crate::error::CadenceError::Config(format!(
                "database.max_connections must be at least {MIN_STORE_CONNECTIONS}"
            )));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        return path;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn file_values_and_env_overrides_merge() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [database]
                host = "db.internal"
                dbname = "jobs"
                sslmode = "verify-full"

                [scheduler]
                client_name = "worker-1"
                dispatch_mode = "serial"
                "#,
            )?;
            jail.set_env("CADENCE_SCHEDULER__VERBOSE", "true");
            jail.set_env("CADENCE_DATABASE__PORT", "6543");

            let config = CadenceConfig::load(Some("cadence.toml")).expect("config loads");
            assert_eq!(config.database.host, "db.internal");
            assert_eq!(config.database.dbname, "jobs");
            assert_eq!(config.database.port, 6543);
            assert_eq!(config.database.sslmode, SslMode::VerifyFull);
            assert_eq!(config.scheduler.client_name, "worker-1");
            assert_eq!(config.scheduler.dispatch_mode, DispatchMode::Serial);
            assert!(config.scheduler.verbose);
            assert_eq!(
                config.scheduler.poll_interval_secs,
                DEFAULT_POLL_INTERVAL_SECS
            );
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let config = CadenceConfig::load(Some("nope.toml")).expect("config loads");
            assert_eq!(config.database.user, "scheduler");
            assert_eq!(config.scheduler.dispatch_mode, DispatchMode::Concurrent);
            assert!(config.validate().is_err(), "client name is required");
            Ok(())
        });
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut config = CadenceConfig::default();
        config.scheduler.client_name = "worker-1".to_string();
        assert!(config.validate().is_ok());

        config.scheduler.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_a_pool_too_small_for_one_chain() {
        let mut config = CadenceConfig::default();
        config.scheduler.client_name = "worker-1".to_string();
        config.database.max_connections = MIN_STORE_CONNECTIONS - 1;
        assert!(config.validate().is_err());

        config.database.max_connections = MIN_STORE_CONNECTIONS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_client_name() {
        let mut config = CadenceConfig::default();
        config.scheduler.client_name = "   ".to_string();
        assert!(config.validate().is_err());
    }
}
