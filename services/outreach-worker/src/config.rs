//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret is loaded from OAUTH_CLIENT_SECRET or
//! client_secret_file and never stored in the TOML itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use conn_pool::PoolConfig;
use credential_refresh::RefreshConfig;
use ratelimit::ServiceLimits;
use response_cache::CacheConfig;
use scheduler::{ProcessorConfig, RetryPolicy};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub pool: PoolSection,
    /// Token refresh is disabled when the section is absent.
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    /// Limits per external service, keyed by service name.
    #[serde(default)]
    pub rate_limits: HashMap<String, ServiceLimits>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One processing pass, then exit.
    Once,
    #[default]
    Continuous,
}

#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Processors polling the queue concurrently in continuous mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    /// Attempts for jobs enqueued through the runtime.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Jobs processing longer than this are assumed orphaned by a crashed worker.
    #[serde(default = "default_stale_job")]
    pub stale_job_secs: u64,
    /// Completed jobs older than this are deleted. Failed jobs are kept.
    #[serde(default = "default_finished_retention")]
    pub finished_retention_secs: u64,
    /// Serves /health and /metrics when set.
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,
    #[serde(default = "default_admin_max_connections")]
    pub admin_max_connections: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    /// SQLite URL for the job queue and usage log. In-memory stores when unset.
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CacheSection {
    /// JSON file backing the cache. In-memory only when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,
    /// TTL overrides per category, in seconds.
    #[serde(default)]
    pub ttl: HashMap<String, u64>,
}

#[derive(Debug, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_pool_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_pool_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_pool_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    /// Credential JSON file shared by every worker process.
    pub path: PathBuf,
    /// Directory for refresh lock files. Defaults to the credential file's directory.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to OAUTH_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
    #[serde(default = "default_lock_poll")]
    pub lock_poll_millis: u64,
    #[serde(default = "default_stale_lock")]
    pub stale_lock_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    10
}

fn default_workers() -> usize {
    1
}

fn default_job_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    60
}

fn default_backoff_cap() -> u64 {
    300
}

fn default_stale_job() -> u64 {
    1800
}

fn default_finished_retention() -> u64 {
    7 * 24 * 3600
}

fn default_admin_max_connections() -> usize {
    64
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_sweep_probability() -> f64 {
    0.01
}

fn default_pool_max_connections() -> usize {
    10
}

fn default_pool_ttl() -> u64 {
    300
}

fn default_pool_sweep_interval() -> u64 {
    60
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    900
}

fn default_lock_wait() -> u64 {
    30
}

fn default_lock_poll() -> u64 {
    500
}

fn default_stale_lock() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            job_timeout_secs: default_job_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            stale_job_secs: default_stale_job(),
            finished_retention_secs: default_finished_retention(),
            admin_addr: None,
            admin_max_connections: default_admin_max_connections(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            path: None,
            default_ttl_secs: default_cache_ttl(),
            sweep_probability: default_sweep_probability(),
            ttl: HashMap::new(),
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: default_pool_max_connections(),
            ttl_secs: default_pool_ttl(),
            sweep_interval_secs: default_pool_sweep_interval(),
            health_check_timeout_secs: default_health_check_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl WorkerConfig {
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            batch_size: self.batch_size,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            retry: RetryPolicy {
                base: Duration::from_secs(self.backoff_base_secs),
                cap: Duration::from_secs(self.backoff_cap_secs),
            },
        }
    }
}

impl CacheSection {
    pub fn cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig {
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            ..CacheConfig::default()
        }
        .with_sweep_probability(self.sweep_probability);
        for (category, secs) in &self.ttl {
            config = config.with_category(category.clone(), Duration::from_secs(*secs));
        }
        config
    }
}

impl PoolSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            ttl: Duration::from_secs(self.ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..PoolConfig::default()
        }
    }
}

impl CredentialsConfig {
    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            threshold: Duration::from_secs(self.refresh_threshold_secs),
            lock_wait: Duration::from_secs(self.lock_wait_secs),
            lock_poll: Duration::from_millis(self.lock_poll_millis),
            stale_lock: Duration::from_secs(self.stale_lock_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    /// Lock directory, falling back to the credential file's parent.
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(|| {
            self.path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(credentials) = config.credentials.as_mut() {
            if let Ok(secret) = std::env::var("OAUTH_CLIENT_SECRET") {
                credentials.client_secret = Some(Secret::new(secret));
            } else if let Some(ref secret_file) = credentials.client_secret_file {
                let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read client_secret_file {}: {e}",
                        secret_file.display()
                    ))
                })?;
                let secret = secret.trim().to_owned();
                if !secret.is_empty() {
                    credentials.client_secret = Some(Secret::new(secret));
                }
            }
        }

        Ok(config)
    }

    /// Reject settings that would make a component misbehave at runtime.
    pub fn validate(&self) -> common::Result<()> {
        let worker = &self.worker;
        for (name, value) in [
            ("worker.poll_interval_secs", worker.poll_interval_secs),
            ("worker.job_timeout_secs", worker.job_timeout_secs),
            ("worker.backoff_base_secs", worker.backoff_base_secs),
            ("worker.batch_size", worker.batch_size as u64),
            ("worker.workers", worker.workers as u64),
            ("worker.max_attempts", u64::from(worker.max_attempts)),
            ("worker.admin_max_connections", worker.admin_max_connections as u64),
            ("pool.max_connections", self.pool.max_connections as u64),
            ("pool.ttl_secs", self.pool.ttl_secs),
        ] {
            if value == 0 {
                return Err(common::Error::config(format!("{name} must be greater than 0")));
            }
        }
        if worker.backoff_cap_secs < worker.backoff_base_secs {
            return Err(common::Error::config(format!(
                "worker.backoff_cap_secs ({}) must not be below backoff_base_secs ({})",
                worker.backoff_cap_secs, worker.backoff_base_secs
            )));
        }

        if let Some(url) = &self.storage.database_url
            && !url.starts_with("sqlite:")
        {
            return Err(common::Error::config(format!(
                "storage.database_url must be a sqlite: URL, got: {url}"
            )));
        }

        self.cache
            .cache_config()
            .validate()
            .map_err(|e| common::Error::config(format!("cache: {e}")))?;

        if let Some(credentials) = &self.credentials {
            if !credentials.token_endpoint.starts_with("http://")
                && !credentials.token_endpoint.starts_with("https://")
            {
                return Err(common::Error::config(format!(
                    "credentials.token_endpoint must start with http:// or https://, got: {}",
                    credentials.token_endpoint
                )));
            }
            if credentials.client_id.trim().is_empty() {
                return Err(common::Error::config("credentials.client_id must not be empty"));
            }
            if credentials.lock_poll_millis == 0 || credentials.request_timeout_secs == 0 {
                return Err(common::Error::config(
                    "credentials.lock_poll_millis and request_timeout_secs must be greater than 0",
                ));
            }
        }

        for (service, limits) in &self.rate_limits {
            if let Some((window, _)) = limits.enforced_windows().find(|(_, limit)| *limit == 0) {
                return Err(common::Error::config(format!(
                    "rate_limits.{service}: limit for {window} must be greater than 0"
                )));
            }
            if limits.monthly_credits == Some(0) {
                return Err(common::Error::config(format!(
                    "rate_limits.{service}: monthly_credits must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("outreach-worker.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratelimit::Window;
    use std::sync::Mutex;

    /// Serializes tests that touch environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn full_toml() -> &'static str {
        r#"
[worker]
mode = "once"
batch_size = 25
workers = 4
admin_addr = "127.0.0.1:9090"

[storage]
database_url = "sqlite:outreach.db"

[cache]
default_ttl_secs = 600

[cache.ttl]
domain_score = 86400
email_lookup = 604800

[pool]
max_connections = 4

[rate_limits.hunter]
per_minute = 10
per_day = 500
monthly_credits = 2000

[rate_limits.hunter.costs]
domain_search = 1
email_verifier = 2

[rate_limits.openai]
per_minute = 60
"#
    }

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", full_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.worker.mode, Mode::Once);
        assert_eq!(config.worker.batch_size, 25);
        assert_eq!(config.worker.workers, 4);
        assert_eq!(config.worker.poll_interval_secs, 60);
        assert_eq!(
            config.worker.admin_addr,
            Some("127.0.0.1:9090".parse().unwrap())
        );
        assert_eq!(
            config.storage.database_url.as_deref(),
            Some("sqlite:outreach.db")
        );
        assert!(config.credentials.is_none());

        let hunter = &config.rate_limits["hunter"];
        assert_eq!(hunter.limit(Window::Minute), Some(10));
        assert_eq!(hunter.cost_of("email_verifier"), 2);
        assert_eq!(config.rate_limits.len(), 2);

        let cache = config.cache.cache_config();
        assert_eq!(cache.ttl_for("domain_score"), Duration::from_secs(86400));
        assert_eq!(cache.ttl_for("anything_else"), Duration::from_secs(600));
        assert_eq!(config.pool.pool_config().max_connections, 4);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", "");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.worker.mode, Mode::Continuous);
        assert!(config.storage.database_url.is_none());
        assert!(config.rate_limits.is_empty());

        let processor = config.worker.processor_config();
        assert_eq!(processor.batch_size, 10);
        assert_eq!(processor.job_timeout, Duration::from_secs(300));
        assert_eq!(processor.retry.base, Duration::from_secs(60));
        assert_eq!(processor.retry.cap, Duration::from_secs(300));
        assert_eq!(config.pool.pool_config().ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/path/config.toml")).is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.toml", "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", "[worker]\nbatch_size = 0\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("worker.batch_size"), "got: {err}");
    }

    #[test]
    fn test_rejects_cap_below_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.toml",
            "[worker]\nbackoff_base_secs = 120\nbackoff_cap_secs = 60\n",
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_rejects_zero_window_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", "[rate_limits.hunter]\nper_hour = 0\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("rate_limits.hunter"), "got: {err}");
    }

    #[test]
    fn test_rejects_bad_sweep_probability() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", "[cache]\nsweep_probability = 1.5\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_rejects_non_sqlite_database_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.toml",
            "[storage]\ndatabase_url = \"postgres://localhost/outreach\"\n",
        );
        assert!(Config::load(&path).is_err());
    }

    fn credentials_toml(secret_file: Option<&Path>) -> String {
        let mut toml = String::from(
            r#"
[credentials]
path = "/var/lib/outreach/credentials.json"
token_endpoint = "https://oauth2.example.com/token"
client_id = "outreach-worker"
"#,
        );
        if let Some(file) = secret_file {
            toml.push_str(&format!("client_secret_file = \"{}\"\n", file.display()));
        }
        toml
    }

    #[test]
    fn test_credentials_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", &credentials_toml(None));

        unsafe { remove_env("OAUTH_CLIENT_SECRET") };
        let config = Config::load(&path).unwrap();
        let credentials = config.credentials.unwrap();
        assert!(credentials.client_secret.is_none());
        assert_eq!(credentials.lock_dir(), PathBuf::from("/var/lib/outreach"));

        let refresh = credentials.refresh_config();
        assert_eq!(refresh.threshold, Duration::from_secs(900));
        assert_eq!(refresh.lock_wait, Duration::from_secs(30));
        assert_eq!(refresh.lock_poll, Duration::from_millis(500));
        assert_eq!(refresh.stale_lock, Duration::from_secs(300));
    }

    #[test]
    fn test_client_secret_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", &credentials_toml(None));

        unsafe { set_env("OAUTH_CLIENT_SECRET", "env-secret") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("OAUTH_CLIENT_SECRET") };

        let secret = config.credentials.unwrap().client_secret.unwrap();
        assert_eq!(secret.expose(), "env-secret");
        assert!(!format!("{secret:?}").contains("env-secret"));
    }

    #[test]
    fn test_client_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = write(dir.path(), "client_secret", "file-secret\n");
        let path = write(
            dir.path(),
            "config.toml",
            &credentials_toml(Some(&secret_path)),
        );

        unsafe { remove_env("OAUTH_CLIENT_SECRET") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.credentials.unwrap().client_secret.unwrap().expose(),
            "file-secret"
        );
    }

    #[test]
    fn test_client_secret_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = write(dir.path(), "client_secret", "file-secret");
        let path = write(
            dir.path(),
            "config.toml",
            &credentials_toml(Some(&secret_path)),
        );

        unsafe { set_env("OAUTH_CLIENT_SECRET", "env-secret") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("OAUTH_CLIENT_SECRET") };

        assert_eq!(
            config.credentials.unwrap().client_secret.unwrap().expose(),
            "env-secret"
        );
    }

    #[test]
    fn test_rejects_plain_token_endpoint() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = credentials_toml(None).replace("https://oauth2", "ftp://oauth2");
        let path = write(dir.path(), "config.toml", &toml);
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/env/path.toml"));
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("outreach-worker.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(Some("/cli/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/cli/path.toml"));
    }
}
