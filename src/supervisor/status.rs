//! Server status and change notification.
//!
//! Observers do not receive queued messages. They wait until a generation
//! counter moves and then re-read the supervisor state, so a slow observer only
//! ever sees the latest state.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle status of the supervised server, derived from the process handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// No process handle is held.
    Disabled,
    /// A process handle is held and the process is alive.
    Running,
    /// A process handle is held but the process already exited.
    Closed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Running => "running",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a [`Subscription`] wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Status,
    Output,
    Timeout,
    /// The publisher was dropped; no further signals will arrive.
    Closed,
}

/// Broadcasts `status_changed` and `output_changed` signals.
pub struct StatusPublisher {
    status_tx: watch::Sender<u64>,
    output_tx: watch::Sender<u64>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(0);
        let (output_tx, _) = watch::channel(0);
        Self { status_tx, output_tx }
    }

    pub fn notify_status_changed(&self) {
        self.status_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn notify_output_changed(&self) {
        self.output_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// New subscriptions only wake for signals sent after this call.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            status_rx: self.status_tx.subscribe(),
            output_rx: self.output_tx.subscribe(),
        }
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    status_rx: watch::Receiver<u64>,
    output_rx: watch::Receiver<u64>,
}

impl Subscription {
    pub async fn wait_status(&mut self, timeout: Option<Duration>) -> Wake {
        let rx = &mut self.status_rx;
        with_timeout(timeout, async move {
            match rx.changed().await {
                Ok(()) => Wake::Status,
                Err(_) => Wake::Closed,
            }
        })
        .await
    }

    pub async fn wait_output(&mut self, timeout: Option<Duration>) -> Wake {
        let rx = &mut self.output_rx;
        with_timeout(timeout, async move {
            match rx.changed().await {
                Ok(()) => Wake::Output,
                Err(_) => Wake::Closed,
            }
        })
        .await
    }

    /// Wait for whichever signal fires first.
    pub async fn wait_any(&mut self, timeout: Option<Duration>) -> Wake {
        let Self { status_rx, output_rx } = self;
        with_timeout(timeout, async move {
            tokio::select! {
                res = status_rx.changed() => if res.is_ok() { Wake::Status } else { Wake::Closed },
                res = output_rx.changed() => if res.is_ok() { Wake::Output } else { Wake::Closed },
            }
        })
        .await
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, fut: F) -> Wake
where
    F: Future<Output = Wake>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or(Wake::Timeout),
        None => fut.await,
    }
}
