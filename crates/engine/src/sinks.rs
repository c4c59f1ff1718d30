//! Destinations for cycle reports

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::api::MessageSink;
use crate::error::EngineResult;
use crate::report::{render_broadcast, render_table, CycleReport};

#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, report: &CycleReport) -> EngineResult<()>;
}

/// Prints the dashboard table to stdout
#[derive(Debug, Clone, Default)]
pub struct ConsoleSink;

#[async_trait]
impl ReportSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn publish(&self, report: &CycleReport) -> EngineResult<()> {
        println!("{}", render_table(report));
        Ok(())
    }
}

/// Broadcasts the report to a chat, on the first cycle and then every
/// `every_cycles` cycles
pub struct TelegramSink {
    client: Arc<dyn MessageSink>,
    chat_id: String,
    every_cycles: u64,
}

impl TelegramSink {
    pub fn new(client: Arc<dyn MessageSink>, chat_id: impl Into<String>, every_cycles: u64) -> Self {
        Self {
            client,
            chat_id: chat_id.into(),
            every_cycles: every_cycles.max(1),
        }
    }

    fn is_due(&self, cycle: u64) -> bool {
        cycle.saturating_sub(1) % self.every_cycles == 0
    }
}

#[async_trait]
impl ReportSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn publish(&self, report: &CycleReport) -> EngineResult<()> {
        if !self.is_due(report.cycle) {
            debug!(cycle = report.cycle, "Telegram broadcast not due");
            return Ok(());
        }
        self.client
            .send_message(&self.chat_id, &render_broadcast(report))
            .await?;
        info!(cycle = report.cycle, "Telegram broadcast sent");
        Ok(())
    }
}

/// Keeps the latest report for the HTTP snapshot endpoint
#[derive(Clone, Default)]
pub struct SnapshotStore {
    latest: Arc<RwLock<Option<CycleReport>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self) -> Option<CycleReport> {
        self.latest.read().await.clone()
    }
}

#[async_trait]
impl ReportSink for SnapshotStore {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn publish(&self, report: &CycleReport) -> EngineResult<()> {
        *self.latest.write().await = Some(report.clone());
        Ok(())
    }
}
