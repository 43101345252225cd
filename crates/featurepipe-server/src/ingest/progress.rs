//! Progress event channel
//!
//! The orchestrator pushes [`ProgressEvent`]s into a bounded channel; the
//! request handler drains it into the response body. A closed channel means
//! the caller went away.

use featurepipe_common::{LogLevel, ProgressEvent};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Default number of events buffered between the job and the caller
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// What happened to an event handed to [`ProgressReporter::emit_or`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The receiver is gone
    Closed,
    /// The channel stayed full until the caller gave up
    Abandoned,
}

#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressEvent>,
    level: LogLevel,
}

impl ProgressReporter {
    /// Reporter copying log lines at `level` and above to the stream.
    /// Warnings and errors are always copied.
    pub fn channel(level: LogLevel, capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, level }, rx)
    }

    /// Send one event, waiting as long as the channel is full; `false` once
    /// the receiver is gone
    pub async fn emit(&self, event: ProgressEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Send one event unless `give_up` resolves while waiting for room
    pub async fn emit_or<F: Future>(&self, event: ProgressEvent, give_up: F) -> Delivery {
        tokio::select! {
            biased;
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(event);
                    Delivery::Sent
                },
                Err(_) => Delivery::Closed,
            },
            _ = give_up => Delivery::Abandoned,
        }
    }

    /// Log through tracing; returns the event to stream if the job's level
    /// lets it through
    pub fn log_event(&self, level: LogLevel, message: impl Into<String>) -> Option<ProgressEvent> {
        let message = message.into();
        match level {
            LogLevel::Trace => trace!(target: "featurepipe::job", "{}", message),
            LogLevel::Debug => debug!(target: "featurepipe::job", "{}", message),
            LogLevel::Info => info!(target: "featurepipe::job", "{}", message),
            LogLevel::Warn => warn!(target: "featurepipe::job", "{}", message),
            LogLevel::Error => error!(target: "featurepipe::job", "{}", message),
        }

        self.level
            .min(LogLevel::Warn)
            .allows(level)
            .then(|| ProgressEvent::log(level, message))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
