//! Server-sent event streams for status and console output.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures_util::stream::{self, Stream};

use super::super::IPCServer;
use crate::supervisor::status::{Subscription, Wake};
use crate::supervisor::{ServerStatus, Supervisor};

pub const STATUS_HEARTBEAT: Duration = Duration::from_secs(60);
pub const IDLE_MARKER_INTERVAL: Duration = Duration::from_secs(10);
pub const IDLE_MARKER: &str = "warden:server_not_running";

fn status_event(supervisor: &Supervisor, name: &'static str) -> Option<Event> {
    match Event::default().event(name).json_data(supervisor.report()) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!("Failed to encode status event: {}", e);
            None
        }
    }
}

/// GET /api/server/status/stream
///
/// Current status on subscribe, again after every transition, and a
/// heartbeat carrying the same payload when nothing changed for a minute.
pub async fn status_stream_handler(
    State(state): State<IPCServer>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.supervisor.subscribe();
    let initial = status_event(&state.supervisor, "status");

    let stream = stream::unfold(
        (state.supervisor, subscription, initial),
        |(supervisor, mut subscription, mut pending)| async move {
            loop {
                if let Some(event) = pending.take() {
                    return Some((Ok(event), (supervisor, subscription, None)));
                }
                pending = match subscription.wait_status(Some(STATUS_HEARTBEAT)).await {
                    Wake::Status => status_event(&supervisor, "status"),
                    Wake::Timeout => status_event(&supervisor, "heartbeat"),
                    Wake::Output => None,
                    Wake::Closed => return None,
                };
            }
        },
    );

    Sse::new(stream)
}

struct ConsoleStream {
    supervisor: Arc<Supervisor>,
    subscription: Subscription,
    cursor: u64,
    pending: VecDeque<Event>,
}

impl ConsoleStream {
    fn new(supervisor: Arc<Supervisor>) -> Self {
        let subscription = supervisor.subscribe();
        let mut stream = Self {
            supervisor,
            subscription,
            cursor: 0,
            pending: VecDeque::new(),
        };
        if stream.supervisor.status() == ServerStatus::Running {
            // 실행 중이면 기존 기록부터 전송
            stream.queue_new_lines();
        } else {
            stream.cursor = stream.supervisor.last_console_id().unwrap_or(0);
            stream.queue_idle_marker();
        }
        stream
    }

    fn queue_new_lines(&mut self) {
        for line in self.supervisor.console_since(self.cursor) {
            self.cursor = line.id;
            match Event::default().event("line").id(line.id.to_string()).json_data(&line) {
                Ok(event) => self.pending.push_back(event),
                Err(e) => tracing::error!("Failed to encode console line {}: {}", line.id, e),
            }
        }
    }

    fn queue_idle_marker(&mut self) {
        self.pending
            .push_back(Event::default().event("idle").data(IDLE_MARKER));
    }

    /// Wait for the next batch of events. `false` once the publisher is gone.
    async fn fill(&mut self) -> bool {
        let running = self.supervisor.status() == ServerStatus::Running;
        let timeout = (!running).then_some(IDLE_MARKER_INTERVAL);

        match self.subscription.wait_any(timeout).await {
            Wake::Output => self.queue_new_lines(),
            Wake::Status => {
                self.queue_new_lines();
                if self.supervisor.status() != ServerStatus::Running {
                    self.queue_idle_marker();
                }
            }
            Wake::Timeout => self.queue_idle_marker(),
            Wake::Closed => return false,
        }
        true
    }
}

/// GET /api/server/console/stream
///
/// Every new console line while the server runs. While it does not, the
/// idle marker is sent on subscribe, on each status change and every 10 s.
pub async fn console_stream_handler(
    State(state): State<IPCServer>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let console = ConsoleStream::new(state.supervisor);

    let stream = stream::unfold(console, |mut console| async move {
        loop {
            if let Some(event) = console.pending.pop_front() {
                return Some((Ok(event), console));
            }
            if !console.fill().await {
                return None;
            }
        }
    });

    Sse::new(stream)
}
