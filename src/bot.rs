//! Bot runner: the scheduler loop driving the engine.
//!
//! Each tick takes one price snapshot for every symbol with open exposure
//! and sequentially evaluates DCA triggers, take profit, stop loss,
//! progressive targets, trailing stops, and OCO orders against that single
//! snapshot. No per-position threads exist; consistency within a tick comes
//! from the shared snapshot, and cross-process coordination happens at the
//! store through idempotency keys and atomic per-record updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::db::Database;
use crate::trading::Orchestrator;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Seconds between evaluation ticks
    pub tick_interval_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
        }
    }
}

/// The scheduler that drives the orchestrator.
pub struct Bot {
    config: BotConfig,
    orchestrator: Arc<Orchestrator>,
    /// Snapshot target for safety state; absent when running purely in
    /// memory
    db: Option<Arc<Database>>,
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(config: BotConfig, orchestrator: Arc<Orchestrator>, db: Option<Arc<Database>>) -> Self {
        Self {
            config,
            orchestrator,
            db,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for external shutdown control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Restore engine state from the store before the first tick.
    pub async fn initialize(&self) -> Result<()> {
        let restored = self.orchestrator.restore_from_store().await?;
        info!(restored, "bot initialized");
        Ok(())
    }

    /// Main run loop. Returns after a shutdown signal.
    pub async fn run(&self) -> Result<()> {
        info!(
            tick_interval = self.config.tick_interval_secs,
            "starting scheduler loop"
        );

        let mut tick_interval = interval(Duration::from_secs(self.config.tick_interval_secs));

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            tick_interval.tick().await;

            if let Err(e) = self.tick().await {
                error!(error = %e, "error in scheduler tick");
            }
        }

        self.persist_safety_state().await;
        let stats = {
            let engine = self.orchestrator.engine();
            let engine = engine.read().await;
            engine.stats()
        };
        info!(
            active = stats.active,
            partially_closed = stats.partially_closed,
            tp_closed = stats.tp_closed,
            sl_closed = stats.sl_closed,
            cancelled = stats.cancelled,
            "scheduler stopped"
        );
        Ok(())
    }

    /// A single evaluation pass against one price snapshot.
    async fn tick(&self) -> Result<()> {
        let prices = self.orchestrator.price_snapshot().await;
        if prices.is_empty() {
            debug!("no open exposure, idle tick");
            return Ok(());
        }

        // The kill switch and circuit breaker gate new execution (DCA
        // fills); risk-reducing exits always run.
        let allow_new = {
            let safety = self.orchestrator.safety();
            let mut safety = safety.write().await;
            let verdict = safety.trading_allowed();
            if !verdict.allowed {
                debug!(reason = %verdict.reason, "new execution gated this tick");
            }
            verdict.allowed
        };

        self.orchestrator.monitor_positions(&prices, allow_new).await;
        self.orchestrator.monitor_targets(&prices).await;
        self.orchestrator.monitor_advanced(&prices).await;

        let archived = {
            let engine = self.orchestrator.engine();
            let mut engine = engine.write().await;
            engine.sweep_closed()
        };
        if !archived.is_empty() {
            info!(count = archived.len(), "archived closed positions");
        }

        self.persist_safety_state().await;
        Ok(())
    }

    async fn persist_safety_state(&self) {
        if let Some(db) = &self.db {
            let safety = self.orchestrator.safety();
            let safety = safety.read().await;
            if let Err(e) = db.save_safety_state(&safety).await {
                error!(error = %e, "failed to persist safety state");
            }
        }
    }
}
