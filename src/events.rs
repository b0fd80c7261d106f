use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub type EventSender = UnboundedSender<ProgressEvent>;

/// Advisory progress stream for callers that want structured events instead
/// of (or in addition to) the terminal output. Dropped receivers are fine;
/// emitting never blocks and never affects the run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    RunStarted {
        portal: String,
        total: usize,
        concurrency: usize,
    },
    SessionEstablished {
        portal: String,
    },
    JobSucceeded {
        index: usize,
        subscriber_id: String,
    },
    JobFailed {
        index: usize,
        subscriber_id: String,
        kind: &'static str,
        message: String,
    },
    JobRequeued {
        index: usize,
        subscriber_id: String,
    },
    ConcurrencyReduced {
        from: usize,
        to: usize,
    },
    CooldownApplied {
        duration: Duration,
    },
    Throughput {
        processed: usize,
        total: usize,
        per_minute: f64,
        eta_seconds: u64,
    },
    RunFinished {
        successes: usize,
        failures: usize,
        interrupted: usize,
        duration_seconds: u64,
    },
}

pub fn emit(events: &Option<EventSender>, event: ProgressEvent) {
    if let Some(sender) = events {
        let _ = sender.send(event);
    }
}
