use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;
use tributary_contracts::events::{EventEmitter, PipeEvent, StatusLevel};

/// Forwards an event to the host, logging instead of failing when the host
/// rejects it. UI notices never abort a request.
pub fn emit_best_effort(emitter: &dyn EventEmitter, event: PipeEvent) {
    if let Err(err) = emitter.emit(&event) {
        warn!(event_type = event.event_type(), error = %err, "event emission failed");
    }
}

/// Request-scoped status channel.
///
/// Non-terminal statuses closer together than `min_interval` are dropped;
/// terminal ones always go out. Disabled reporters only pass chat messages.
pub struct StatusReporter {
    emitter: Arc<dyn EventEmitter>,
    enabled: bool,
    min_interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl StatusReporter {
    pub fn new(emitter: Arc<dyn EventEmitter>, enabled: bool, min_interval: Duration) -> Self {
        Self {
            emitter,
            enabled,
            min_interval,
            last_emit: Mutex::new(None),
        }
    }

    pub fn emit_status(&self, level: StatusLevel, description: &str, done: bool) -> bool {
        if !self.enabled {
            return false;
        }
        let now = Instant::now();
        {
            let mut last_emit = self.last_emit.lock().unwrap_or_else(PoisonError::into_inner);
            let throttled = last_emit
                .map(|last| now.duration_since(last) < self.min_interval)
                .unwrap_or(false);
            if throttled && !done {
                return false;
            }
            *last_emit = Some(now);
        }
        emit_best_effort(
            self.emitter.as_ref(),
            PipeEvent::status(level, description, done),
        );
        true
    }

    pub fn emit_message(&self, content: &str) {
        emit_best_effort(self.emitter.as_ref(), PipeEvent::message(content));
    }
}
