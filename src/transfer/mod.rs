//! # Transfer Coordinator
//!
//! Ships the cycle's artifacts to the collector and brings back the remote
//! command, over exactly one transport chosen at startup:
//!
//! - [`ftp::SessionTransport`]: persistent file-transfer session, reconnects
//!   and retries once per cycle, fetches `remotecmd.cfg` after every batch
//! - [`rest::ExchangeTransport`]: one JSON request/response per cycle
//!
//! ## What gets sent
//! Artifacts are sent only when dirty. Dirty flags are sticky: they are set
//! by the cycle that produced new content and cleared only by a successful
//! delivery, so an image missed during an outage goes out with the next
//! working cycle. The status record is sent every cycle as a liveness signal.
//!
//! ## Failure
//! A transport error or timeout is logged and treated as "no command this
//! cycle". It never stops the capture loop.

pub mod ftp;
pub mod rest;

use crate::config::StationInfoFile;
use crate::params::RemoteCommand;
use crate::status::StatusRecord;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// File names on the collector.
pub const REMOTE_STATION_INFO: &str = "stationinfo.txt";
pub const REMOTE_TOTAL: &str = "imgtotal.jpg";
pub const REMOTE_DETAIL: &str = "imgdetail.jpg";
pub const REMOTE_STATUS: &str = "status.txt";
pub const REMOTE_COMMAND: &str = "remotecmd.cfg";

/// Whole-cycle budget in units of the per-operation timeout. Covers a full
/// batch plus the single reconnect.
const CYCLE_BUDGET_FACTOR: u32 = 8;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("cannot connect: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transfer IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot decode reply: {0}")]
    Decode(String),

    #[error("{0} not found on the collector")]
    NotFound(String),
}

impl TransferError {
    /// Errors after which the session is unusable.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            TransferError::Connect(_) | TransferError::Timeout(_) | TransferError::Io(_)
        )
    }
}

/// Artifacts with content the collector has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyFlags {
    pub info: bool,
    pub total: bool,
    pub detail: bool,
}

/// What one cycle sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub info: bool,
    pub total: bool,
    pub detail: bool,
    /// Always set
    pub status: bool,
}

impl TransferPlan {
    pub fn from_flags(flags: &DirtyFlags) -> Self {
        TransferPlan {
            info: flags.info,
            total: flags.total,
            detail: flags.detail,
            status: true,
        }
    }

    pub fn includes_images(&self) -> bool {
        self.total || self.detail
    }
}

/// The payload of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub station_info: Option<StationInfoFile>,
    pub total: Option<Vec<u8>>,
    pub detail: Option<Vec<u8>>,
    pub status: StatusRecord,
}

/// A way to reach the collector.
#[allow(async_fn_in_trait)]
pub trait Transport {
    fn name(&self) -> &'static str;

    /// Send the batch and return the remote command, if the collector has
    /// one.
    async fn deliver(&mut self, batch: &Batch) -> Result<Option<RemoteCommand>, TransferError>;

    /// Release any open session.
    async fn close(&mut self) {}
}

/// Local files holding the artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub total: PathBuf,
    pub detail: PathBuf,
}

/// Result of one cycle's transfer step.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub plan: TransferPlan,
    pub delivered: bool,
    pub command: Option<RemoteCommand>,
}

pub struct TransferCoordinator<T: Transport> {
    transport: T,
    station_info: StationInfoFile,
    artifacts: ArtifactPaths,
    budget: Duration,
    pending: DirtyFlags,
}

impl<T: Transport> TransferCoordinator<T> {
    /// Station info is pending from the start so every boot announces it.
    pub fn new(
        transport: T,
        station_info: StationInfoFile,
        artifacts: ArtifactPaths,
        op_timeout: Duration,
    ) -> Self {
        TransferCoordinator {
            transport,
            station_info,
            artifacts,
            budget: op_timeout * CYCLE_BUDGET_FACTOR,
            pending: DirtyFlags {
                info: true,
                ..DirtyFlags::default()
            },
        }
    }

    pub fn pending(&self) -> DirtyFlags {
        self.pending
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mark freshly rendered images as dirty.
    pub fn mark_images(&mut self, total: bool, detail: bool) {
        self.pending.total |= total;
        self.pending.detail |= detail;
    }

    /// Whether any image is still waiting for delivery.
    pub fn images_pending(&self) -> bool {
        self.pending.total || self.pending.detail
    }

    /// Deliver this cycle's plan. Never fails; a failed delivery keeps the
    /// dirty flags and yields no command.
    pub async fn run_cycle(&mut self, status: &StatusRecord) -> TransferOutcome {
        let plan = TransferPlan::from_flags(&self.pending);
        info!(
            "Transfer via {} (info {}, total {}, detail {})",
            self.transport.name(),
            plan.info,
            plan.total,
            plan.detail
        );

        let batch = Batch {
            station_info: plan.info.then(|| self.station_info.clone()),
            total: read_artifact(plan.total, &self.artifacts.total).await,
            detail: read_artifact(plan.detail, &self.artifacts.detail).await,
            status: status.clone(),
        };

        let result = tokio::time::timeout(self.budget, self.transport.deliver(&batch)).await;
        let command = match result {
            Ok(Ok(command)) => command,
            Ok(Err(e)) => {
                warn!("Transfer failed: {}", e);
                return TransferOutcome {
                    plan,
                    delivered: false,
                    command: None,
                };
            }
            Err(_) => {
                warn!("Transfer exceeded {:?}, abandoned", self.budget);
                self.transport.close().await;
                return TransferOutcome {
                    plan,
                    delivered: false,
                    command: None,
                };
            }
        };

        if batch.station_info.is_some() {
            self.pending.info = false;
        }
        if batch.total.is_some() {
            self.pending.total = false;
        }
        if batch.detail.is_some() {
            self.pending.detail = false;
        }
        debug!("Transfer complete, command: {}", command.is_some());

        TransferOutcome {
            plan,
            delivered: true,
            command,
        }
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

async fn read_artifact(wanted: bool, path: &std::path::Path) -> Option<Vec<u8>> {
    if !wanted {
        return None;
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}
