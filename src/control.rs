//! Control channel for external lifecycle commands.
//!
//! Commands arrive as `{"type": ..., "payload": ...}` messages, either over
//! `POST /control` or in-process through a [`ControlHandle`].  Every command
//! is answered exactly once.  Commands run independently of each other and a
//! dispatched command always runs to completion, even if its caller stops
//! waiting for the reply.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::lifecycle::LifecycleManager;
use crate::metrics::MetricsRegistry;
use crate::precache::PrecacheReport;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlCommand {
    /// Precache the given URLs into the active generation.
    #[serde(rename = "PRECACHE")]
    Precache(Vec<String>),
    /// Precache every asset listed in the origin's manifest.
    #[serde(rename = "PRECACHE_ALL")]
    PrecacheAll,
    #[serde(rename = "CLEAR", alias = "CLEAR_CACHE")]
    Clear,
    #[serde(rename = "GET_SIZES", alias = "GET_CACHE_SIZE")]
    GetSizes,
}

impl ControlCommand {
    fn name(&self) -> &'static str {
        match self {
            ControlCommand::Precache(_) => "PRECACHE",
            ControlCommand::PrecacheAll => "PRECACHE_ALL",
            ControlCommand::Clear => "CLEAR",
            ControlCommand::GetSizes => "GET_SIZES",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Sizes {
        sizes: BTreeMap<String, usize>,
    },
    Status {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlReply {
    pub fn ok() -> Self {
        ControlReply::Status {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        ControlReply::Status {
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ControlReply::Sizes { .. } => true,
            ControlReply::Status { success, .. } => *success,
        }
    }
}

impl From<PrecacheReport> for ControlReply {
    fn from(report: PrecacheReport) -> Self {
        if report.is_complete_success() {
            ControlReply::ok()
        } else {
            ControlReply::failed(format!(
                "{} of {} assets failed to precache",
                report.failures.len(),
                report.attempted
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Executes control commands against the lifecycle manager.
pub struct ControlService {
    lifecycle: Arc<LifecycleManager>,
    metrics: MetricsRegistry,
}

impl ControlService {
    pub fn new(lifecycle: Arc<LifecycleManager>, metrics: MetricsRegistry) -> Self {
        Self { lifecycle, metrics }
    }

    /// Run one command.  Failures are reported in the reply, never raised.
    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn handle(&self, command: ControlCommand) -> ControlReply {
        let result = match command {
            ControlCommand::Precache(urls) => self.precache(&urls).await,
            ControlCommand::PrecacheAll => self.precache_all().await,
            ControlCommand::Clear => self.lifecycle.clear().await.map(|()| ControlReply::ok()),
            ControlCommand::GetSizes => self.sizes().await,
        };

        match result {
            Ok(reply) => {
                debug!(success = reply.is_success(), "control command finished");
                reply
            }
            Err(e) => {
                warn!(error = %e, "control command failed");
                ControlReply::failed(format!("{e:#}"))
            }
        }
    }

    async fn precache(&self, urls: &[String]) -> Result<ControlReply> {
        let generation = self.lifecycle.active().context("no active generation")?;
        let report = self.lifecycle.precache().run(&generation, urls).await;
        Ok(report.into())
    }

    async fn precache_all(&self) -> Result<ControlReply> {
        let generation = self.lifecycle.active().context("no active generation")?;
        let report = self.lifecycle.precache().run_manifest(&generation).await?;
        Ok(report.into())
    }

    async fn sizes(&self) -> Result<ControlReply> {
        let sizes = self.lifecycle.sizes().await?;
        for (partition, count) in &sizes {
            self.metrics.metrics.set_partition_entries(partition, *count);
        }
        Ok(ControlReply::Sizes { sizes })
    }
}

// ---------------------------------------------------------------------------
// In-process channel
// ---------------------------------------------------------------------------

struct ControlRequest {
    command: ControlCommand,
    reply: oneshot::Sender<ControlReply>,
}

/// Cloneable sender side of the control channel.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    /// Dispatch `command` and wait for its reply.
    pub async fn send(&self, command: ControlCommand) -> Result<ControlReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest { command, reply })
            .await
            .map_err(|_| anyhow::anyhow!("control channel is closed"))?;
        rx.await.context("control command dropped without a reply")
    }
}

/// Start the dispatcher task.  It exits once every [`ControlHandle`] has been
/// dropped.
pub fn spawn_channel(service: Arc<ControlService>, capacity: usize) -> (ControlHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ControlRequest>(capacity.max(1));

    let task = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let reply = service.handle(request.command).await;
                if request.reply.send(reply).is_err() {
                    debug!("control caller went away before the reply");
                }
            });
        }
        info!("control channel closed");
    });

    (ControlHandle { tx }, task)
}
