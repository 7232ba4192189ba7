use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};
use tributary_contracts::events::StatusLevel;

use crate::status::StatusReporter;
use crate::transport::WebhookTransport;
use crate::{extract_response_field, normalize_escaped_newlines};

pub const NO_UPDATE: &str = "no update";
pub const ERROR_MARKER: &str = "Error - ";
pub const THINKING_MARKER: &str = "<details";

/// Chain-of-thought fragments gathered while a single request is in flight.
#[derive(Debug, Clone, Default)]
pub struct ThinkingLog {
    fragments: Arc<Mutex<Vec<String>>>,
}

impl ThinkingLog {
    pub fn push(&self, fragment: String) {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fragment);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.fragments.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Continue,
    Stop,
}

/// Background loop that asks the status webhook what the workflow is doing.
pub struct StatusPollWorker {
    pub transport: Arc<dyn WebhookTransport>,
    pub url: String,
    pub bearer_token: String,
    pub payload: Value,
    pub response_field: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub reporter: Arc<StatusReporter>,
    pub thinking: ThinkingLog,
    pub session_id: String,
}

impl StatusPollWorker {
    fn run(self, stop_rx: mpsc::Receiver<()>, stop: Arc<StopSwitch>) {
        debug!(session_id = %self.session_id, "status poll started");
        let mut polls: u64 = 0;
        loop {
            match stop_rx.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if stop.is_tripped() {
                break;
            }

            polls += 1;
            let text = match self.fetch_status() {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(err) => {
                    debug!(session_id = %self.session_id, error = %err, "status poll failed");
                    continue;
                }
            };
            let step = match stop.hold_open() {
                Some(_open) => self.handle_status(&text),
                None => break,
            };
            if step == PollStep::Stop {
                stop.trip();
                break;
            }
        }
        debug!(session_id = %self.session_id, polls, "status poll stopped");
    }

    fn fetch_status(&self) -> Result<Option<String>> {
        let reply = self
            .transport
            .post_json(&self.url, &self.bearer_token, &self.payload, self.timeout)
            .with_context(|| format!("status request failed ({})", self.url))?;
        let payload = reply.json_or_error("N8N status")?;
        Ok(extract_response_field(&payload, &self.response_field))
    }

    pub fn handle_status(&self, text: &str) -> PollStep {
        if text.contains(ERROR_MARKER) {
            warn!(session_id = %self.session_id, "workflow reported an error");
            self.reporter.emit_message(text);
            self.reporter
                .emit_status(StatusLevel::Error, "Workflow reported an error", true);
            return PollStep::Stop;
        }
        if text.trim() == NO_UPDATE {
            return PollStep::Continue;
        }
        if text.contains(THINKING_MARKER) {
            let fragment = normalize_escaped_newlines(text);
            self.reporter.emit_message(&fragment);
            self.thinking.push(fragment);
            return PollStep::Continue;
        }
        self.reporter.emit_status(StatusLevel::Info, text, false);
        PollStep::Continue
    }
}

/// Stop flag shared by a poll and its owner. The worker emits only while
/// holding the switch open, so once `trip` returns it stays silent even if a
/// status request is still in flight.
#[derive(Debug, Default)]
struct StopSwitch {
    stopped: Mutex<bool>,
}

impl StopSwitch {
    fn trip(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn is_tripped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hold_open(&self) -> Option<MutexGuard<'_, bool>> {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard {
            None
        } else {
            Some(guard)
        }
    }
}

/// Identifies one started poll so a late cleanup cannot stop a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTicket(u64);

struct PollHandle {
    ticket: PollTicket,
    stop: Arc<StopSwitch>,
    stop_tx: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl PollHandle {
    /// Silences and wakes the worker without waiting for it.
    fn stop(self) -> thread::JoinHandle<()> {
        let PollHandle {
            stop,
            stop_tx,
            handle,
            ..
        } = self;
        stop.trip();
        drop(stop_tx);
        handle
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Live status polls keyed by session id. At most one per session.
///
/// Stopped workers are not joined on the request path; a worker blocked on a
/// status request exits when that request returns. Their threads are joined
/// once finished, on the next `start` or `cancel`.
#[derive(Default)]
pub struct PollRegistry {
    polls: Mutex<HashMap<String, PollHandle>>,
    retired: Mutex<Vec<thread::JoinHandle<()>>>,
    next_ticket: AtomicU64,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops any poll already running for the session, then spawns `worker`
    /// in its place.
    pub fn start(&self, session_id: &str, worker: StatusPollWorker) -> Result<PollTicket> {
        if let Some(previous) = self.take(session_id) {
            info!(session_id, "replacing running status poll");
            self.retire(previous);
        }
        self.reap();

        let (stop_tx, stop_rx) = mpsc::channel();
        let stop = Arc::new(StopSwitch::default());
        let worker_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("status-poll".to_string())
            .spawn(move || worker.run(stop_rx, worker_stop))
            .context("status poll thread spawn failed")?;

        let ticket = PollTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        let replaced = self.lock().insert(
            session_id.to_string(),
            PollHandle {
                ticket,
                stop,
                stop_tx,
                handle,
            },
        );
        if let Some(replaced) = replaced {
            self.retire(replaced);
        }
        Ok(ticket)
    }

    /// Stops the session's poll if it is still the one `ticket` started. No
    /// event from that poll is emitted after this returns.
    pub fn cancel(&self, session_id: &str, ticket: PollTicket) -> bool {
        let owned = {
            let mut polls = self.lock();
            let current = polls
                .get(session_id)
                .map(|handle| handle.ticket == ticket)
                .unwrap_or(false);
            if current {
                polls.remove(session_id)
            } else {
                None
            }
        };
        let stopped = match owned {
            Some(handle) => {
                self.retire(handle);
                true
            }
            None => false,
        };
        self.reap();
        stopped
    }

    pub fn is_polling(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Stopped workers whose threads have not been joined yet.
    pub fn pending_shutdowns(&self) -> usize {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn cancel_all(&self) {
        let drained: Vec<PollHandle> = self.lock().drain().map(|(_, handle)| handle).collect();
        for handle in drained {
            self.retire(handle);
        }
        self.reap();
    }

    fn retire(&self, handle: PollHandle) {
        let thread = handle.stop();
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(thread);
    }

    fn reap(&self) {
        let finished: Vec<thread::JoinHandle<()>> = {
            let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
            let (finished, running): (Vec<_>, Vec<_>) =
                retired.drain(..).partition(|thread| thread.is_finished());
            *retired = running;
            finished
        };
        for thread in finished {
            if thread.join().is_err() {
                warn!("status poll thread panicked");
            }
        }
    }

    fn take(&self, session_id: &str) -> Option<PollHandle> {
        self.lock().remove(session_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PollHandle>> {
        self.polls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::{json, Value};
    use tributary_contracts::events::RecordingEmitter;

    use super::*;
    use crate::transport::HttpReply;

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
        replies: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl WebhookTransport for CountingTransport {
        fn post_json(
            &self,
            _url: &str,
            _bearer_token: &str,
            _payload: &Value,
            _timeout: Duration,
        ) -> Result<HttpReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
            let text = if replies.is_empty() {
                NO_UPDATE.to_string()
            } else {
                replies.remove(0)
            };
            Ok(HttpReply::new(200, json!({ "output": text }).to_string()))
        }
    }

    /// Serves scripted outcomes in order, then "no update".
    #[derive(Default)]
    struct FlakyTransport {
        outcomes: Mutex<VecDeque<Result<HttpReply>>>,
        timeouts: Mutex<Vec<Duration>>,
    }

    impl WebhookTransport for FlakyTransport {
        fn post_json(
            &self,
            _url: &str,
            _bearer_token: &str,
            _payload: &Value,
            timeout: Duration,
        ) -> Result<HttpReply> {
            self.timeouts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(timeout);
            self.outcomes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(HttpReply::new(200, json!({ "output": NO_UPDATE }).to_string()))
                })
        }
    }

    fn worker(
        transport: Arc<dyn WebhookTransport>,
        recorder: Arc<RecordingEmitter>,
        thinking: ThinkingLog,
    ) -> StatusPollWorker {
        StatusPollWorker {
            transport,
            url: "https://flows.local/webhook/status".to_string(),
            bearer_token: "secret".to_string(),
            payload: json!({"sessionId": "s1", "user_id": "u1", "chatInput": "status check"}),
            response_field: "output".to_string(),
            interval: Duration::from_millis(5),
            timeout: Duration::from_secs(1),
            reporter: Arc::new(StatusReporter::new(recorder, true, Duration::ZERO)),
            thinking,
            session_id: "s1".to_string(),
        }
    }

    #[test]
    fn decision_table_routes_each_kind_of_status() {
        let recorder = Arc::new(RecordingEmitter::new());
        let thinking = ThinkingLog::default();
        let worker = worker(
            Arc::new(CountingTransport::default()),
            recorder.clone(),
            thinking.clone(),
        );

        assert_eq!(worker.handle_status("sending..."), PollStep::Continue);
        assert_eq!(worker.handle_status(NO_UPDATE), PollStep::Continue);
        assert_eq!(
            worker.handle_status("<details type=\"reasoning\">step one\\nstep two</details>"),
            PollStep::Continue
        );
        assert_eq!(worker.handle_status("Error - boom"), PollStep::Stop);

        assert_eq!(
            recorder.messages(),
            vec![
                "<details type=\"reasoning\">step one\nstep two</details>".to_string(),
                "Error - boom".to_string(),
            ]
        );
        let statuses = recorder.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].description, "sending...");
        assert!(!statuses[0].done);
        assert!(statuses[1].done);
        assert_eq!(thinking.len(), 1);
    }

    #[test]
    fn cancel_stops_polling_promptly() -> Result<()> {
        let transport = Arc::new(CountingTransport::default());
        let recorder = Arc::new(RecordingEmitter::new());
        let registry = PollRegistry::new();

        let ticket = registry.start(
            "s1",
            worker(transport.clone(), recorder, ThinkingLog::default()),
        )?;
        thread::sleep(Duration::from_millis(40));
        assert!(registry.is_polling("s1"));
        assert!(registry.cancel("s1", ticket));
        assert!(!registry.is_polling("s1"));

        thread::sleep(Duration::from_millis(20));
        let calls_after_cancel = transport.calls.load(Ordering::SeqCst);
        assert!(calls_after_cancel > 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(transport.calls.load(Ordering::SeqCst), calls_after_cancel);
        Ok(())
    }

    #[test]
    fn starting_again_replaces_the_session_poll() -> Result<()> {
        let first_transport = Arc::new(CountingTransport::default());
        let second_transport = Arc::new(CountingTransport::default());
        let recorder = Arc::new(RecordingEmitter::new());
        let registry = PollRegistry::new();

        let first = registry.start(
            "s1",
            worker(first_transport.clone(), recorder.clone(), ThinkingLog::default()),
        )?;
        let second = registry.start(
            "s1",
            worker(second_transport, recorder, ThinkingLog::default()),
        )?;
        assert_eq!(registry.active_count(), 1);

        thread::sleep(Duration::from_millis(20));
        let first_calls = first_transport.calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(first_transport.calls.load(Ordering::SeqCst), first_calls);

        assert!(!registry.cancel("s1", first));
        assert!(registry.is_polling("s1"));
        assert!(registry.cancel("s1", second));
        assert_eq!(registry.active_count(), 0);
        Ok(())
    }

    #[test]
    fn error_marker_ends_the_worker_on_its_own() -> Result<()> {
        let transport = Arc::new(CountingTransport::default());
        transport
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(["working".to_string(), "Error - upstream down".to_string()]);
        let recorder = Arc::new(RecordingEmitter::new());
        let registry = PollRegistry::new();

        let ticket = registry.start(
            "s1",
            worker(transport.clone(), recorder.clone(), ThinkingLog::default()),
        )?;
        thread::sleep(Duration::from_millis(80));
        assert!(!registry.is_polling("s1"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            recorder.messages().last().map(String::as_str),
            Some("Error - upstream down")
        );
        assert!(registry.cancel("s1", ticket));
        Ok(())
    }

    #[test]
    fn cancel_returns_while_a_status_request_is_in_flight() -> Result<()> {
        let transport = Arc::new(CountingTransport {
            delay: Duration::from_millis(400),
            ..CountingTransport::default()
        });
        transport
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push("still crunching".to_string());
        let recorder = Arc::new(RecordingEmitter::new());
        let registry = PollRegistry::new();

        let ticket = registry.start(
            "s1",
            worker(transport.clone(), recorder.clone(), ThinkingLog::default()),
        )?;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        assert!(registry.cancel("s1", ticket));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(registry.pending_shutdowns(), 1);

        // The reply lands after cancel and must not reach the host.
        thread::sleep(Duration::from_millis(500));
        assert!(recorder.events().is_empty());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        registry.cancel_all();
        assert_eq!(registry.pending_shutdowns(), 0);
        Ok(())
    }

    #[test]
    fn failed_status_requests_are_retried_with_the_status_timeout() -> Result<()> {
        let transport = Arc::new(FlakyTransport::default());
        transport
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([
                Err(anyhow::anyhow!("connection refused")),
                Ok(HttpReply::new(502, "bad gateway")),
                Ok(HttpReply::new(200, "<html>")),
                Ok(HttpReply::new(200, json!({"output": "step two"}).to_string())),
            ]);
        let recorder = Arc::new(RecordingEmitter::new());
        let registry = PollRegistry::new();

        let ticket = registry.start(
            "s1",
            worker(transport.clone(), recorder.clone(), ThinkingLog::default()),
        )?;
        thread::sleep(Duration::from_millis(100));
        assert!(registry.is_polling("s1"));
        assert!(registry.cancel("s1", ticket));

        let descriptions: Vec<String> = recorder
            .statuses()
            .into_iter()
            .map(|status| status.description)
            .collect();
        assert_eq!(descriptions, vec!["step two".to_string()]);
        assert!(recorder.messages().is_empty());

        let timeouts = transport
            .timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        assert!(timeouts.len() >= 4);
        assert!(timeouts
            .iter()
            .all(|timeout| *timeout == Duration::from_secs(1)));
        Ok(())
    }

    #[test]
    fn thinking_log_take_drains() {
        let log = ThinkingLog::default();
        log.push("a".to_string());
        log.push("b".to_string());
        assert_eq!(log.take(), vec!["a".to_string(), "b".to_string()]);
        assert!(log.is_empty());
    }
}
