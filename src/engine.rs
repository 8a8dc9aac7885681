//! Engine
//!
//! Owns every component built from one [`Config`] and runs the background
//! loops: the dispatcher that turns fired arms into executor runs, and the
//! maintenance loop that sweeps the scheduler and persists the store.

use serde::Serialize;
use std::future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Interval, MissedTickBehavior};

use crate::config::{Config, ConfigError};
use crate::executor::{Executor, ExecutorStats};
use crate::manager::QueryManager;
use crate::query::QueryStatus;
use crate::reader::QueryReader;
use crate::scheduler::{Arm, Scheduler, SchedulerPort, SweepReport, TimerQueue};
use crate::store::{QueryStore, StoreError, StoreResult};
use crate::upstream::{HttpUpstream, Upstream, UpstreamError};
use crate::usage::UsageTracker;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to load store snapshot: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("No tokio runtime available: {0}")]
    Runtime(String),
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub queries: usize,
    pub by_status: Vec<StatusCount>,
    pub pending_arms: usize,
    pub tracked_usage: usize,
    pub executor: ExecutorStats,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: QueryStatus,
    pub count: usize,
}

pub struct Engine {
    config: Config,
    store: Arc<QueryStore>,
    usage: Arc<UsageTracker>,
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor>,
    manager: QueryManager,
    reader: QueryReader,
    start_time: Instant,
}

impl Engine {
    /// Assemble an engine from explicit parts
    pub fn new(
        config: Config,
        store: QueryStore,
        port: Arc<dyn SchedulerPort>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let store = Arc::new(store);
        let usage = Arc::new(UsageTracker::new(&config.scheduling));
        // Usage counters are not persisted; restart every window from now
        let now = chrono::Utc::now();
        for query in store.list() {
            usage.register(&query.id, now);
        }
        let scheduler = Arc::new(Scheduler::new(port, &config.scheduling));
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&usage),
            Arc::clone(&scheduler),
            upstream,
            &config.scheduling,
        ));
        let manager = QueryManager::new(
            Arc::clone(&store),
            Arc::clone(&usage),
            Arc::clone(&scheduler),
            config.limits.clone(),
            config.templates.clone(),
            &config.upstream,
        );
        let reader = QueryReader::new(Arc::clone(&store), Arc::clone(&usage));

        Ok(Engine {
            config,
            store,
            usage,
            scheduler,
            executor,
            manager,
            reader,
            start_time: Instant::now(),
        })
    }

    /// Build the production engine: snapshot-backed store, HTTP upstream,
    /// and an in-process timer queue. Fired arms arrive on the returned receiver.
    pub fn from_config(config: Config) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Arm>), EngineError> {
        let runtime = Handle::try_current().map_err(|e| EngineError::Runtime(e.to_string()))?;
        let snapshot_path = config.storage.snapshot_path();
        let store = QueryStore::load_snapshot(&snapshot_path)?;
        tracing::info!(
            path = %snapshot_path.display(),
            queries = store.len(),
            "store_loaded"
        );

        let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
        let (timers, fired) = TimerQueue::new(runtime);
        let engine = Engine::new(config, store, timers, upstream)?;
        Ok((Arc::new(engine), fired))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn manager(&self) -> &QueryManager {
        &self.manager
    }

    pub fn reader(&self) -> &QueryReader {
        &self.reader
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Arm every active query that is not armed yet
    pub fn sweep(&self) -> SweepReport {
        self.scheduler.sweep(&self.store, chrono::Utc::now())
    }

    /// Write the store snapshot; returns the number of queries saved
    pub fn persist(&self) -> StoreResult<usize> {
        let path = self.config.storage.snapshot_path();
        let saved = self.store.save_snapshot(&path)?;
        tracing::debug!(path = %path.display(), queries = saved, "store_persisted");
        Ok(saved)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queries: self.store.len(),
            by_status: self
                .store
                .count_by_status()
                .into_iter()
                .map(|(status, count)| StatusCount { status, count })
                .collect(),
            pending_arms: self.scheduler.port().pending_count(),
            tracked_usage: self.usage.tracked_queries(),
            executor: self.executor.stats(),
            uptime_secs: self.uptime_seconds(),
        }
    }

    /// Run each fired arm on its own task until shutdown or the channel closes
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut fired: mpsc::UnboundedReceiver<Arm>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    arm = fired.recv() => {
                        let Some(arm) = arm else { break };
                        let executor = Arc::clone(&engine.executor);
                        tokio::spawn(async move {
                            let outcome = executor.execute(&arm).await;
                            tracing::trace!(query_id = %arm.query_id, ?outcome, "arm_dispatched");
                        });
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("dispatcher_stopped");
        })
    }

    /// Periodic sweep and snapshot until shutdown. Intervals of 0 disable a task.
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut sweep_every = periodic(engine.config.scheduling.sweep_interval_secs);
        let mut persist_every = periodic(engine.config.storage.persist_interval_secs);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tick(&mut sweep_every) => {
                        engine.sweep();
                    }
                    () = tick(&mut persist_every) => {
                        let persister = Arc::clone(&engine);
                        match tokio::task::spawn_blocking(move || persister.persist()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!(error = %e, "store_persist_failed"),
                            Err(e) => tracing::error!(error = %e, "store_persist_panicked"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("maintenance_stopped");
        })
    }
}

fn periodic(secs: u64) -> Option<Interval> {
    if secs == 0 {
        return None;
    }
    let period = Duration::from_secs(secs);
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}
