//! Composition root
//!
//! Builds every component exactly once from the loaded config and hands out
//! shared references. Startup order:
//! 1. Storage: SQLite pool (WAL) when `storage.database_url` is set, else in-memory
//! 2. Rate limiter over the usage store
//! 3. Response cache (file-backed when `cache.path` is set)
//! 4. Connection pool with the registered resource factories
//! 5. Credential refresh manager when `[credentials]` is present
//! 6. Built-in job handlers and periodic sub-tasks

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use conn_pool::{Pool, PooledResource, ResourceFactory};
use credential_refresh::{CredentialStore, FileLock, OAuthRefresher, RefreshManager};
use ratelimit::{MemoryUsageStore, RateLimiter, SqliteUsageStore, UsageStore};
use response_cache::ResponseCache;
use scheduler::{
    CallGuard, CycleReport, HandlerRegistry, JobHandler, JobId, JobStore, MemoryJobStore, NewJob,
    PeriodicTasks, Processor, SqliteJobStore,
};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{Config, CredentialsConfig};
use crate::error::{Error, Result};
use crate::handlers::{INVALIDATE_CACHE, InvalidateCache, REFRESH_CREDENTIAL, RefreshCredential};
use crate::tasks;

/// One pool holds every resource class behind the capability trait.
pub type WorkerPool = Pool<Box<dyn PooledResource>>;

pub type BoxedFactory = Arc<dyn ResourceFactory<Box<dyn PooledResource>>>;

const DB_MAX_CONNECTIONS: u32 = 5;
const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker components, built once and shared by every processor.
pub struct Runtime {
    instance: Uuid,
    config: Config,
    jobs: Arc<dyn JobStore>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    pool: Arc<WorkerPool>,
    credentials: Option<Arc<RefreshManager>>,
    handlers: HandlerRegistry,
    tasks: Arc<PeriodicTasks>,
}

/// Collects resource factories before the pool is sealed behind an `Arc`.
pub struct RuntimeBuilder {
    config: Config,
    factories: Vec<(String, BoxedFactory)>,
}

impl RuntimeBuilder {
    pub fn resource_factory(mut self, class: impl Into<String>, factory: BoxedFactory) -> Self {
        self.factories.push((class.into(), factory));
        self
    }

    pub async fn build(self) -> Result<Runtime> {
        let config = self.config;
        config.validate()?;

        let (jobs, usage): (Arc<dyn JobStore>, Arc<dyn UsageStore>) =
            match &config.storage.database_url {
                Some(url) => {
                    let db = connect(url).await?;
                    (
                        Arc::new(SqliteJobStore::new(db.clone()).await?),
                        Arc::new(SqliteUsageStore::new(db).await?),
                    )
                }
                None => {
                    info!("no database configured, using in-memory job queue and usage log");
                    (
                        Arc::new(MemoryJobStore::new()),
                        Arc::new(MemoryUsageStore::new()),
                    )
                }
            };

        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone(), usage));

        let cache_config = config.cache.cache_config();
        let cache = Arc::new(match &config.cache.path {
            Some(path) => ResponseCache::load(cache_config, path.clone()).await?,
            None => ResponseCache::in_memory(cache_config)?,
        });

        let mut pool = WorkerPool::new(config.pool.pool_config());
        for (class, factory) in self.factories {
            pool.register(class, factory);
        }
        let pool = Arc::new(pool);

        let credentials = match &config.credentials {
            Some(section) => Some(Arc::new(refresh_manager(section).await?)),
            None => None,
        };

        let mut handlers = HandlerRegistry::new();
        handlers.register(INVALIDATE_CACHE, InvalidateCache(cache.clone()));
        if let Some(manager) = &credentials {
            handlers.register(REFRESH_CREDENTIAL, RefreshCredential(manager.clone()));
        }

        let worker = &config.worker;
        let mut periodic = PeriodicTasks::new();
        if let (Some(manager), Some(section)) = (&credentials, &config.credentials) {
            periodic.add(
                Arc::new(tasks::CredentialRefresh(manager.clone())),
                Duration::from_secs(section.refresh_interval_secs),
            );
        }
        periodic.add(
            Arc::new(tasks::PoolSweep(pool.clone())),
            pool.config().sweep_interval,
        );
        periodic.add(
            Arc::new(tasks::CachePurge(cache.clone())),
            tasks::CACHE_PURGE_INTERVAL,
        );
        periodic.add(
            Arc::new(tasks::UsagePrune(limiter.clone())),
            tasks::USAGE_PRUNE_INTERVAL,
        );
        periodic.add(
            Arc::new(tasks::StaleJobRecovery {
                store: jobs.clone(),
                stale_after: Duration::from_secs(worker.stale_job_secs),
            }),
            tasks::STALE_RECOVERY_INTERVAL,
        );
        periodic.add(
            Arc::new(tasks::FinishedJobPurge {
                store: jobs.clone(),
                retention: Duration::from_secs(worker.finished_retention_secs),
            }),
            tasks::FINISHED_PURGE_INTERVAL,
        );
        periodic.add(
            Arc::new(tasks::QueueDepth(jobs.clone())),
            tasks::QUEUE_DEPTH_INTERVAL,
        );

        let instance = Uuid::new_v4();
        info!(
            instance = %instance,
            services = limiter.services().len(),
            credentials = credentials.is_some(),
            periodic_tasks = periodic.len(),
            "worker runtime ready"
        );

        Ok(Runtime {
            instance,
            config,
            jobs,
            limiter,
            cache,
            pool,
            credentials,
            handlers,
            tasks: Arc::new(periodic),
        })
    }
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            factories: Vec::new(),
        }
    }

    /// Build with no resource factories.
    pub async fn build(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn credentials(&self) -> Option<&Arc<RefreshManager>> {
        self.credentials.as_ref()
    }

    /// Limiter and cache wrapper for handlers making external calls.
    pub fn guard(&self) -> CallGuard {
        CallGuard::new(self.limiter.clone()).with_cache(self.cache.clone())
    }

    /// Register a pipeline handler. Must happen before processors are started.
    pub fn register_handler(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.register_arc(job_type, handler);
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.job_types()
    }

    /// New job carrying the configured `max_attempts`.
    pub fn new_job(&self, job_type: impl Into<String>, payload: Value) -> NewJob {
        NewJob::new(job_type, payload).with_max_attempts(self.config.worker.max_attempts)
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let job_type = job.job_type.clone();
        let id = self.jobs.enqueue(job, common::time::now_millis()).await?;
        info!(job_id = id, job_type, "job enqueued");
        Ok(id)
    }

    pub fn processor(&self) -> Processor {
        Processor::new(
            self.jobs.clone(),
            Arc::new(self.handlers.clone()),
            self.config.worker.processor_config(),
        )
        .with_tasks(self.tasks.clone())
    }

    /// Single pass over the queue.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let report = self.processor().run_once().await?;
        if let Ok(counts) = self.jobs.counts().await {
            crate::metrics::record_queue_depth(&counts);
        }
        Ok(report)
    }

    /// Run `worker.workers` processors until `stop` flips to true.
    ///
    /// Returns once every processor has finished its current pass.
    pub async fn run(&self, stop: watch::Receiver<bool>) {
        let processor = Arc::new(self.processor());
        let mut handles = Vec::with_capacity(self.config.worker.workers);
        for worker in 0..self.config.worker.workers {
            let processor = processor.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move { processor.run(worker, stop).await }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }

    /// Close every pooled connection.
    pub async fn shutdown(&self) {
        let closed = self.pool.close_all().await;
        info!(closed, "connection pool closed");
    }

    /// Summary for `/health`. `healthy` is false when the queue is unreachable.
    pub async fn health(&self) -> (bool, Value) {
        let (healthy, jobs) = match self.jobs.counts().await {
            Ok(counts) => (true, json!(counts)),
            Err(e) => (false, json!({"error": e.to_string()})),
        };
        let credentials = match &self.credentials {
            Some(manager) => json!({"enabled": true, "resources": manager.store().len().await}),
            None => json!({"enabled": false}),
        };
        let body = json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "instance": self.instance.to_string(),
            "mode": format!("{:?}", self.config.worker.mode).to_lowercase(),
            "workers": self.config.worker.workers,
            "job_types": self.job_types(),
            "jobs": jobs,
            "pool": self.pool.health().await,
            "cache": self.cache.stats().await,
            "rate_limits": self.limiter.stats().await,
            "credentials": credentials,
        });
        (healthy, body)
    }
}

async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(DB_BUSY_TIMEOUT)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(DB_MAX_CONNECTIONS)
        .acquire_timeout(DB_ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await?;
    info!(max_connections = DB_MAX_CONNECTIONS, "database pool initialized with WAL mode");
    Ok(pool)
}

async fn refresh_manager(section: &CredentialsConfig) -> Result<RefreshManager> {
    let store = CredentialStore::load(section.path.clone()).await?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(section.request_timeout_secs))
        .build()
        .map_err(|e| Error::HttpClient(e.to_string()))?;
    let refresher = OAuthRefresher::new(
        client,
        section.token_endpoint.as_str(),
        section.client_id.as_str(),
        section.client_secret.clone(),
    );
    let lock = FileLock::new(section.lock_dir());
    info!(
        path = %section.path.display(),
        lock_dir = %section.lock_dir().display(),
        "credential refresh enabled"
    );
    Ok(RefreshManager::new(
        Arc::new(store),
        Arc::new(refresher),
        Arc::new(lock),
        section.refresh_config(),
    ))
}
