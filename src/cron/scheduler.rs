//! Scheduler for the periodic pipeline ticks.
//!
//! Thin wrapper over `tokio-cron-scheduler` that lets a component re-register
//! its own repeating job under a new interval at runtime. The sync engine
//! uses this to slow its poll cadence once it crosses the caught-up
//! threshold and to restore the catch-up cadence when it falls behind.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use log::info;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// A tick body: cheap to clone, produces one future per invocation.
pub type TickFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct CronScheduler {
    inner: JobScheduler,
}

impl CronScheduler {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            inner: JobScheduler::new().await?,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.start().await?;
        info!("Scheduler started");
        Ok(())
    }

    /// Register a repeating job. Returns the job id for later removal.
    pub async fn add_repeated(&self, name: &str, interval: Duration, tick: TickFn) -> Result<Uuid> {
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| tick())?;
        let id = self.inner.add(job).await?;
        info!("Registered {} job (every {:?})", name, interval);
        Ok(id)
    }

    /// Drop a previously registered job.
    pub async fn remove(&self, id: &Uuid) -> Result<()> {
        self.inner.remove(id).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Scheduler shutting down...");
        self.inner.shutdown().await?;
        Ok(())
    }
}
