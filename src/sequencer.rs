//! Run sequencing — the batch state machine.
//!
//! Owns the run list, the run budget, and the auto-advance logic: create a
//! session, wire the output bridge to it, dispatch the prompt, and once the
//! *latest* run settles idle (regardless of which run the user is looking
//! at), start the next one after a settling delay. The delay avoids racing
//! the backend's own post-completion bookkeeping.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::client::{Backend, ModelSelection, SessionStatus};
use crate::log::{ExecutionLog, LogEvent};
use crate::poller::StatusPoller;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Maximum number of runs in a batch. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBudget {
    Finite(u32),
    Unbounded,
}

impl RunBudget {
    /// Whether another run may start given `existing` runs.
    pub fn allows(&self, existing: usize) -> bool {
        match self {
            RunBudget::Finite(n) => existing < *n as usize,
            RunBudget::Unbounded => true,
        }
    }
}

impl std::fmt::Display for RunBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunBudget::Finite(n) => write!(f, "{n}"),
            RunBudget::Unbounded => write!(f, "∞"),
        }
    }
}

/// Lifecycle state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Busy,
    Idle,
}

/// One attempt of sending the prompt to a fresh session.
///
/// Owned exclusively by the sequencer; `status` and `duration` are written
/// once, when the poller observes the session idle, and never after.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub run_number: u32,
    pub started: Instant,
    pub duration: Option<Duration>,
    pub status: RunStatus,
}

/// What the batch sends on every run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub prompt: String,
    pub model: Option<ModelSelection>,
    pub agent: Option<String>,
    pub budget: RunBudget,
}

/// Seam through which the sequencer (and the native handoff) drive the
/// output bridge.
pub trait BridgeControl {
    fn attach(&mut self, session_id: &str) -> Result<()>;
    fn kill(&mut self);
}

/// Outcome of a `start_next` attempt, for surfacing to the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started { run_number: u32, session_id: String },
    AlreadyStarting,
    BudgetExhausted,
    Failed { error: String },
}

pub struct RunSequencer {
    backend: Arc<dyn Backend>,
    poller: StatusPoller,
    plan: RunPlan,
    log: Arc<ExecutionLog>,
    settle_delay: Duration,
    runs: Vec<Run>,
    current_index: usize,
    starting: bool,
    /// Run number the pending (or consumed) auto-advance belongs to.
    /// One-shot per idle latest run: a failed start is not retried.
    advance_scheduled_for: Option<u32>,
    advance_at: Option<Instant>,
    budget_announced: bool,
    last_error: Option<String>,
}

impl RunSequencer {
    pub fn new(
        backend: Arc<dyn Backend>,
        poller: StatusPoller,
        plan: RunPlan,
        settle_delay: Duration,
        log: Arc<ExecutionLog>,
    ) -> Self {
        Self {
            backend,
            poller,
            plan,
            log,
            settle_delay,
            runs: Vec::new(),
            current_index: 0,
            starting: false,
            advance_scheduled_for: None,
            advance_at: None,
            budget_announced: false,
            last_error: None,
        }
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_run(&self) -> Option<&Run> {
        self.runs.get(self.current_index)
    }

    pub fn budget(&self) -> RunBudget {
        self.plan.budget
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn any_busy(&self) -> bool {
        self.runs.iter().any(|r| r.status == RunStatus::Busy)
    }

    /// Live status of a session, from the poller cache.
    pub fn status_of(&self, session_id: &str) -> SessionStatus {
        self.poller.current_status(session_id)
    }

    fn record(&self, event: LogEvent) {
        if let Err(e) = self.log.log(event) {
            warn!("execution log write failed: {e:#}");
        }
    }

    /// Start the next run: create a session, follow it with the view if the
    /// user was already on the most recent run, attach the bridge, and
    /// dispatch the prompt fire-and-forget.
    ///
    /// No-op while a start is in flight or once the budget is exhausted.
    pub fn start_next(&mut self, bridge: &mut dyn BridgeControl) -> StartOutcome {
        if self.starting {
            return StartOutcome::AlreadyStarting;
        }
        if !self.plan.budget.allows(self.runs.len()) {
            if !self.budget_announced {
                self.budget_announced = true;
                info!(budget = %self.plan.budget, "run budget exhausted");
                self.record(LogEvent::BatchStopped {
                    reason: format!("budget exhausted ({} runs)", self.plan.budget),
                });
            }
            return StartOutcome::BudgetExhausted;
        }

        self.starting = true;
        let outcome = self.start_next_inner(bridge);
        self.starting = false;
        outcome
    }

    fn start_next_inner(&mut self, bridge: &mut dyn BridgeControl) -> StartOutcome {
        let session_id = match self.backend.create_session() {
            Ok(id) => id,
            Err(e) => {
                let error = format!("{e:#}");
                warn!(error = %error, "session creation failed, aborting run attempt");
                self.record(LogEvent::SessionCreateFailed {
                    error: error.clone(),
                });
                self.last_error = Some(error.clone());
                return StartOutcome::Failed { error };
            }
        };

        let run_number = self.runs.len() as u32 + 1;
        // Decide view-following before appending: the view moves with the
        // new run only if it was already on the most recent one.
        let follow = self.runs.is_empty() || self.current_index == self.runs.len() - 1;

        self.runs.push(Run {
            id: session_id.clone(),
            run_number,
            started: Instant::now(),
            duration: None,
            status: RunStatus::Busy,
        });
        if follow {
            self.current_index = self.runs.len() - 1;
        }

        info!(run_number, session_id = %session_id, follow, "run started");
        self.record(LogEvent::RunStarted {
            run_number,
            session_id: session_id.clone(),
        });

        // Bridge failure is not fatal: the run proceeds, just without a
        // live view until the next attach.
        if follow {
            if let Err(e) = bridge.attach(&session_id) {
                warn!("bridge attach failed: {e:#}");
            }
        }

        self.poller.start(&session_id);
        self.dispatch_prompt(&session_id);

        StartOutcome::Started {
            run_number,
            session_id,
        }
    }

    fn dispatch_prompt(&self, session_id: &str) {
        self.record(LogEvent::PromptDispatched {
            session_id: session_id.to_string(),
        });

        let backend = Arc::clone(&self.backend);
        let log = Arc::clone(&self.log);
        let session_id = session_id.to_string();
        let prompt = self.plan.prompt.clone();
        let model = self.plan.model.clone();
        let agent = self.plan.agent.clone();

        thread::spawn(move || {
            if let Err(e) =
                backend.send_prompt(&session_id, &prompt, model.as_ref(), agent.as_deref())
            {
                let error = format!("{e:#}");
                warn!(session_id = %session_id, error = %error, "prompt dispatch failed");
                let _ = log.log(LogEvent::DispatchFailed { session_id, error });
            }
        });
    }

    /// Drive polling, finalize idle runs, and auto-advance when due.
    ///
    /// Returns the outcome of an auto-advance attempted on this tick.
    pub fn tick(&mut self, now: Instant, bridge: &mut dyn BridgeControl) -> Option<StartOutcome> {
        self.poller.tick(now);

        // Finalize runs whose sessions settled. Write-once: a finalized run
        // is never touched again.
        for i in 0..self.runs.len() {
            if self.runs[i].status == RunStatus::Busy
                && self.poller.current_status(&self.runs[i].id).is_idle()
            {
                let duration = now.duration_since(self.runs[i].started);
                self.runs[i].status = RunStatus::Idle;
                self.runs[i].duration = Some(duration);
                info!(
                    run_number = self.runs[i].run_number,
                    duration_ms = duration.as_millis() as u64,
                    "run completed"
                );
                self.record(LogEvent::RunCompleted {
                    run_number: self.runs[i].run_number,
                    session_id: self.runs[i].id.clone(),
                    duration_ms: duration.as_millis() as u64,
                });
            }
        }

        // Auto-advance keys on the latest run, not the viewed one: the
        // batch must progress regardless of what the user is inspecting.
        if let Some(latest) = self.runs.last() {
            if latest.status == RunStatus::Idle
                && self.advance_scheduled_for != Some(latest.run_number)
            {
                self.advance_scheduled_for = Some(latest.run_number);
                self.advance_at = Some(now + self.settle_delay);
            }
        }

        if self.advance_at.is_some_and(|at| now >= at) {
            self.advance_at = None;
            return Some(self.start_next(bridge));
        }

        None
    }

    /// Change the view pointer and re-attach the bridge to that run's
    /// session. Run state is untouched; auto-advance still keys on the
    /// latest run.
    pub fn select_run(&mut self, index: usize, bridge: &mut dyn BridgeControl) {
        if index >= self.runs.len() || index == self.current_index {
            return;
        }
        self.current_index = index;
        let session_id = self.runs[index].id.clone();
        if let Err(e) = bridge.attach(&session_id) {
            warn!("bridge attach failed: {e:#}");
        }
        self.record(LogEvent::RunSelected { index, session_id });
    }

    /// Stop all polling. Used during shutdown.
    pub fn stop_all(&mut self) {
        self.poller.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    struct FakeBackend {
        sessions: Mutex<VecDeque<Result<String>>>,
        status: Mutex<HashMap<String, SessionStatus>>,
    }

    impl FakeBackend {
        fn with_sessions(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(ids.iter().map(|id| Ok(id.to_string())).collect()),
                status: Mutex::new(HashMap::new()),
            })
        }

        fn failing_create(message: &str) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(VecDeque::from([Err(anyhow!("{message}"))])),
                status: Mutex::new(HashMap::new()),
            })
        }

        fn set_busy(&self, id: &str) {
            self.status
                .lock()
                .unwrap()
                .insert(id.to_string(), SessionStatus::Busy);
        }

        fn clear_status(&self, id: &str) {
            self.status.lock().unwrap().remove(id);
        }
    }

    impl Backend for FakeBackend {
        fn create_session(&self) -> Result<String> {
            self.sessions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no more sessions scripted")))
        }

        fn send_prompt(
            &self,
            _session_id: &str,
            _content: &str,
            _model: Option<&ModelSelection>,
            _agent: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }

        fn query_status(&self) -> Result<HashMap<String, SessionStatus>> {
            Ok(self.status.lock().unwrap().clone())
        }

        fn list_providers(&self) -> Result<Vec<crate::client::ProviderInfo>> {
            Ok(Vec::new())
        }

        fn list_agents(&self) -> Result<Vec<crate::client::AgentInfo>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeBridge {
        attached: Vec<String>,
    }

    impl BridgeControl for FakeBridge {
        fn attach(&mut self, session_id: &str) -> Result<()> {
            self.attached.push(session_id.to_string());
            Ok(())
        }

        fn kill(&mut self) {}
    }

    fn sequencer(backend: Arc<FakeBackend>, budget: RunBudget) -> RunSequencer {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(ExecutionLog::new(&tmp.path().join("batch.jsonl")).unwrap());
        // Keep the tempdir alive for the whole test process so the open
        // log file stays writable.
        std::mem::forget(tmp);
        let backend_dyn: Arc<dyn Backend> = backend.clone();
        let poller = StatusPoller::new(backend_dyn, Duration::ZERO);
        RunSequencer::new(
            backend,
            poller,
            RunPlan {
                prompt: "improve the code".to_string(),
                model: None,
                agent: None,
                budget,
            },
            DEFAULT_SETTLE_DELAY,
            log,
        )
    }

    #[test]
    fn budget_allows_counts_runs() {
        assert!(RunBudget::Finite(2).allows(0));
        assert!(RunBudget::Finite(2).allows(1));
        assert!(!RunBudget::Finite(2).allows(2));
        assert!(RunBudget::Unbounded.allows(1_000_000));
    }

    #[test]
    fn start_next_creates_run_and_attaches_bridge() {
        let backend = FakeBackend::with_sessions(&["ses_1"]);
        backend.set_busy("ses_1");
        let mut seq = sequencer(backend, RunBudget::Unbounded);
        let mut bridge = FakeBridge::default();

        let outcome = seq.start_next(&mut bridge);
        assert_eq!(
            outcome,
            StartOutcome::Started {
                run_number: 1,
                session_id: "ses_1".to_string(),
            }
        );
        assert_eq!(seq.runs().len(), 1);
        assert_eq!(seq.runs()[0].status, RunStatus::Busy);
        assert_eq!(seq.current_index(), 0);
        assert_eq!(bridge.attached, vec!["ses_1"]);
    }

    #[test]
    fn single_flight_guard_rejects_reentry() {
        let backend = FakeBackend::with_sessions(&["ses_1"]);
        let mut seq = sequencer(backend, RunBudget::Unbounded);
        let mut bridge = FakeBridge::default();

        seq.starting = true;
        assert_eq!(seq.start_next(&mut bridge), StartOutcome::AlreadyStarting);
        assert!(seq.runs().is_empty());
    }

    #[test]
    fn creation_failure_aborts_attempt_and_surfaces_error() {
        let backend = FakeBackend::failing_create("backend down");
        let mut seq = sequencer(backend, RunBudget::Unbounded);
        let mut bridge = FakeBridge::default();

        let outcome = seq.start_next(&mut bridge);
        assert!(matches!(outcome, StartOutcome::Failed { .. }));
        assert!(seq.runs().is_empty());
        assert!(bridge.attached.is_empty());
        assert!(seq.last_error().unwrap().contains("backend down"));
    }

    #[test]
    fn view_follows_new_run_only_from_latest() {
        let backend = FakeBackend::with_sessions(&["ses_1", "ses_2", "ses_3"]);
        backend.set_busy("ses_1");
        backend.set_busy("ses_2");
        backend.set_busy("ses_3");
        let mut seq = sequencer(backend, RunBudget::Unbounded);
        let mut bridge = FakeBridge::default();

        seq.start_next(&mut bridge);
        seq.start_next(&mut bridge);
        assert_eq!(seq.current_index(), 1, "view followed to latest");

        // Navigate back to run #1: the view is pinned there.
        seq.select_run(0, &mut bridge);
        seq.start_next(&mut bridge);
        assert_eq!(seq.current_index(), 0, "inspecting history is not interrupted");
        // The bridge stayed on the inspected run.
        assert_eq!(bridge.attached, vec!["ses_1", "ses_2", "ses_1"]);
    }

    #[test]
    fn select_run_reattaches_bridge_without_touching_state() {
        let backend = FakeBackend::with_sessions(&["ses_1", "ses_2"]);
        backend.set_busy("ses_1");
        backend.set_busy("ses_2");
        let mut seq = sequencer(backend, RunBudget::Unbounded);
        let mut bridge = FakeBridge::default();

        seq.start_next(&mut bridge);
        seq.start_next(&mut bridge);
        seq.select_run(0, &mut bridge);

        assert_eq!(seq.current_index(), 0);
        assert_eq!(seq.runs()[0].status, RunStatus::Busy);
        assert_eq!(bridge.attached.last().map(String::as_str), Some("ses_1"));

        // Out-of-range and same-index selections are no-ops.
        seq.select_run(7, &mut bridge);
        seq.select_run(0, &mut bridge);
        assert_eq!(bridge.attached.len(), 3);
    }

    #[test]
    fn run_finalized_once_with_duration() {
        let backend = FakeBackend::with_sessions(&["ses_1"]);
        backend.set_busy("ses_1");
        let mut seq = sequencer(Arc::clone(&backend), RunBudget::Finite(1));
        let mut bridge = FakeBridge::default();

        seq.start_next(&mut bridge);
        let t0 = Instant::now();
        seq.tick(t0, &mut bridge);
        assert_eq!(seq.runs()[0].status, RunStatus::Busy);

        backend.clear_status("ses_1");
        seq.tick(t0 + Duration::from_millis(1), &mut bridge);
        assert_eq!(seq.runs()[0].status, RunStatus::Idle);
        let duration = seq.runs()[0].duration.unwrap();

        // Later ticks never rewrite the finalized record.
        seq.tick(t0 + Duration::from_secs(10), &mut bridge);
        assert_eq!(seq.runs()[0].duration, Some(duration));
    }

    #[test]
    fn budget_two_auto_advance_scenario() {
        let backend = FakeBackend::with_sessions(&["ses_1", "ses_2"]);
        let mut seq = sequencer(Arc::clone(&backend), RunBudget::Finite(2));
        let mut bridge = FakeBridge::default();

        // Run #1 starts busy.
        backend.set_busy("ses_1");
        let outcome = seq.start_next(&mut bridge);
        assert!(matches!(outcome, StartOutcome::Started { run_number: 1, .. }));

        // Backend drops the session from the status map: poller caches
        // idle, the run finalizes, and an advance is scheduled.
        backend.clear_status("ses_1");
        backend.set_busy("ses_2");
        let t0 = Instant::now();
        assert_eq!(seq.tick(t0, &mut bridge), None);
        assert_eq!(seq.runs()[0].status, RunStatus::Idle);

        // Before the settling delay: no new run.
        let early = seq.tick(t0 + Duration::from_millis(499), &mut bridge);
        assert_eq!(early, None);
        assert_eq!(seq.runs().len(), 1);

        // At the settling delay: run #2 starts automatically.
        let advanced = seq.tick(t0 + Duration::from_millis(500), &mut bridge);
        assert!(matches!(
            advanced,
            Some(StartOutcome::Started { run_number: 2, .. })
        ));
        assert_eq!(seq.runs().len(), 2);

        // Run #2 settles; the third automatic start is suppressed.
        backend.clear_status("ses_2");
        let t1 = t0 + Duration::from_secs(2);
        seq.tick(t1, &mut bridge);
        let exhausted = seq.tick(t1 + Duration::from_millis(500), &mut bridge);
        assert_eq!(exhausted, Some(StartOutcome::BudgetExhausted));
        assert_eq!(seq.runs().len(), 2);

        // No further attempts on later ticks.
        assert_eq!(seq.tick(t1 + Duration::from_secs(5), &mut bridge), None);
    }

    #[test]
    fn failed_auto_advance_is_not_retried() {
        let backend = FakeBackend::with_sessions(&["ses_1"]);
        let mut seq = sequencer(Arc::clone(&backend), RunBudget::Unbounded);
        let mut bridge = FakeBridge::default();

        backend.set_busy("ses_1");
        seq.start_next(&mut bridge);
        backend.clear_status("ses_1");

        let t0 = Instant::now();
        seq.tick(t0, &mut bridge);
        // The scripted backend has no more sessions: the advance fails.
        let advanced = seq.tick(t0 + Duration::from_millis(500), &mut bridge);
        assert!(matches!(advanced, Some(StartOutcome::Failed { .. })));

        // The failure is one-shot; nothing keeps hammering the backend.
        assert_eq!(seq.tick(t0 + Duration::from_secs(3), &mut bridge), None);
        assert!(seq.last_error().is_some());
    }

    #[test]
    fn any_busy_reflects_run_states() {
        let backend = FakeBackend::with_sessions(&["ses_1"]);
        backend.set_busy("ses_1");
        let mut seq = sequencer(Arc::clone(&backend), RunBudget::Finite(1));
        let mut bridge = FakeBridge::default();

        assert!(!seq.any_busy());
        seq.start_next(&mut bridge);
        assert!(seq.any_busy());

        backend.clear_status("ses_1");
        seq.tick(Instant::now(), &mut bridge);
        assert!(!seq.any_busy());
    }
}
