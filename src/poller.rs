//! Per-session status polling.
//!
//! Each tracked session runs the same small state machine: `Polling` (query
//! the backend status map every interval) until the session is reported
//! idle or drops out of the map entirely, then `Settled` with the final
//! status cached. A failed query is swallowed and retried on the next tick;
//! treating it as idle would truncate a run that is still working.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::client::{Backend, SessionStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy)]
struct PollState {
    /// When this session was last queried. `None` means poll on the next tick.
    last_poll: Option<Instant>,
}

/// Tick-driven poller over the backend's live status map.
///
/// All mutable state (status cache, per-session timers) is owned here and
/// only touched through `start`, `tick`, and `stop_all`.
pub struct StatusPoller {
    backend: Arc<dyn Backend>,
    interval: Duration,
    cache: HashMap<String, SessionStatus>,
    polling: HashMap<String, PollState>,
}

impl StatusPoller {
    pub fn new(backend: Arc<dyn Backend>, interval: Duration) -> Self {
        Self {
            backend,
            interval,
            cache: HashMap::new(),
            polling: HashMap::new(),
        }
    }

    /// Begin polling a session. The session starts out cached as busy.
    ///
    /// A session that already settled idle stays settled; idle is terminal.
    pub fn start(&mut self, session_id: &str) {
        if self.cache.get(session_id).is_some_and(SessionStatus::is_idle) {
            return;
        }
        self.cache
            .insert(session_id.to_string(), SessionStatus::Busy);
        self.polling
            .insert(session_id.to_string(), PollState { last_poll: None });
    }

    /// Stop polling everything. Safe to call with nothing active.
    pub fn stop_all(&mut self) {
        self.polling.clear();
    }

    /// Cached status for a session. Never-polled sessions are idle.
    pub fn current_status(&self, session_id: &str) -> SessionStatus {
        self.cache
            .get(session_id)
            .cloned()
            .unwrap_or(SessionStatus::Idle)
    }

    /// True while the session is still in the polling phase.
    #[cfg(test)]
    pub fn is_polling(&self, session_id: &str) -> bool {
        self.polling.contains_key(session_id)
    }

    /// Drive due sessions. Returns the ids that settled on this tick.
    pub fn tick(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<String> = self
            .polling
            .iter()
            .filter(|(_, state)| {
                state
                    .last_poll
                    .is_none_or(|last| now.duration_since(last) >= self.interval)
            })
            .map(|(id, _)| id.clone())
            .collect();

        if due.is_empty() {
            return Vec::new();
        }

        let statuses = match self.backend.query_status() {
            Ok(statuses) => statuses,
            Err(e) => {
                // Transient: keep the timers moving and try again next interval.
                debug!("status query failed, retrying next tick: {e:#}");
                for id in &due {
                    if let Some(state) = self.polling.get_mut(id) {
                        state.last_poll = Some(now);
                    }
                }
                return Vec::new();
            }
        };

        let mut settled = Vec::new();
        for id in due {
            match statuses.get(&id) {
                None | Some(SessionStatus::Idle) => {
                    // Absence means the backend finished bookkeeping for it.
                    self.cache.insert(id.clone(), SessionStatus::Idle);
                    self.polling.remove(&id);
                    debug!(session_id = %id, "session settled idle");
                    settled.push(id);
                }
                Some(status) => {
                    trace!(session_id = %id, ?status, "session still live");
                    self.cache.insert(id.clone(), status.clone());
                    if let Some(state) = self.polling.get_mut(&id) {
                        state.last_poll = Some(now);
                    }
                }
            }
        }
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend that replays a script of status-map responses.
    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<HashMap<String, SessionStatus>>>>,
        queries: Mutex<u32>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<HashMap<String, SessionStatus>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                queries: Mutex::new(0),
            })
        }

        fn query_count(&self) -> u32 {
            *self.queries.lock().unwrap()
        }
    }

    impl Backend for ScriptedBackend {
        fn create_session(&self) -> Result<String> {
            unimplemented!("not used by poller tests")
        }

        fn send_prompt(
            &self,
            _session_id: &str,
            _content: &str,
            _model: Option<&crate::client::ModelSelection>,
            _agent: Option<&str>,
        ) -> Result<()> {
            unimplemented!("not used by poller tests")
        }

        fn query_status(&self) -> Result<HashMap<String, SessionStatus>> {
            *self.queries.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HashMap::new()))
        }

        fn list_providers(&self) -> Result<Vec<crate::client::ProviderInfo>> {
            Ok(Vec::new())
        }

        fn list_agents(&self) -> Result<Vec<crate::client::AgentInfo>> {
            Ok(Vec::new())
        }
    }

    fn busy_map(ids: &[&str]) -> Result<HashMap<String, SessionStatus>> {
        Ok(ids
            .iter()
            .map(|id| (id.to_string(), SessionStatus::Busy))
            .collect())
    }

    #[test]
    fn never_polled_session_reads_idle() {
        let backend = ScriptedBackend::new(vec![]);
        let poller = StatusPoller::new(backend, DEFAULT_POLL_INTERVAL);
        assert_eq!(poller.current_status("ses_unknown"), SessionStatus::Idle);
    }

    #[test]
    fn started_session_is_busy_until_polled() {
        let backend = ScriptedBackend::new(vec![]);
        let mut poller = StatusPoller::new(backend, DEFAULT_POLL_INTERVAL);
        poller.start("ses_a");
        assert_eq!(poller.current_status("ses_a"), SessionStatus::Busy);
        assert!(poller.is_polling("ses_a"));
    }

    #[test]
    fn absent_session_settles_idle() {
        let backend = ScriptedBackend::new(vec![Ok(HashMap::new())]);
        let mut poller = StatusPoller::new(Arc::clone(&backend) as Arc<dyn Backend>, DEFAULT_POLL_INTERVAL);
        poller.start("ses_a");

        let settled = poller.tick(Instant::now());
        assert_eq!(settled, vec!["ses_a".to_string()]);
        assert_eq!(poller.current_status("ses_a"), SessionStatus::Idle);
        assert!(!poller.is_polling("ses_a"));
    }

    #[test]
    fn busy_session_keeps_polling() {
        let backend = ScriptedBackend::new(vec![busy_map(&["ses_a"]), busy_map(&["ses_a"])]);
        let mut poller = StatusPoller::new(Arc::clone(&backend) as Arc<dyn Backend>, Duration::ZERO);
        poller.start("ses_a");

        assert!(poller.tick(Instant::now()).is_empty());
        assert_eq!(poller.current_status("ses_a"), SessionStatus::Busy);
        assert!(poller.tick(Instant::now()).is_empty());
        assert_eq!(backend.query_count(), 2);
    }

    #[test]
    fn retry_status_is_cached_and_polling_continues() {
        let retry = SessionStatus::Retry {
            attempt: 2,
            message: "rate limited".to_string(),
            next_attempt_at: 12345,
        };
        let mut map = HashMap::new();
        map.insert("ses_a".to_string(), retry.clone());

        let backend = ScriptedBackend::new(vec![Ok(map)]);
        let mut poller = StatusPoller::new(backend, DEFAULT_POLL_INTERVAL);
        poller.start("ses_a");

        assert!(poller.tick(Instant::now()).is_empty());
        assert_eq!(poller.current_status("ses_a"), retry);
        assert!(poller.is_polling("ses_a"));
    }

    #[test]
    fn transient_failure_is_swallowed_and_retried() {
        let backend = ScriptedBackend::new(vec![
            Err(anyhow!("connection refused")),
            Ok(HashMap::new()),
        ]);
        let mut poller = StatusPoller::new(Arc::clone(&backend) as Arc<dyn Backend>, Duration::ZERO);
        poller.start("ses_a");

        let now = Instant::now();
        assert!(poller.tick(now).is_empty());
        // Still busy and still polling after the failed query.
        assert_eq!(poller.current_status("ses_a"), SessionStatus::Busy);
        assert!(poller.is_polling("ses_a"));

        let settled = poller.tick(now + Duration::from_millis(1));
        assert_eq!(settled, vec!["ses_a".to_string()]);
    }

    #[test]
    fn poll_interval_is_respected() {
        let backend = ScriptedBackend::new(vec![busy_map(&["ses_a"]), busy_map(&["ses_a"])]);
        let mut poller = StatusPoller::new(Arc::clone(&backend) as Arc<dyn Backend>, Duration::from_secs(1));
        poller.start("ses_a");

        let start = Instant::now();
        poller.tick(start);
        assert_eq!(backend.query_count(), 1);

        // Within the interval: no new query.
        poller.tick(start + Duration::from_millis(200));
        assert_eq!(backend.query_count(), 1);

        poller.tick(start + Duration::from_secs(1));
        assert_eq!(backend.query_count(), 2);
    }

    #[test]
    fn idle_is_terminal() {
        let backend = ScriptedBackend::new(vec![Ok(HashMap::new()), busy_map(&["ses_a"])]);
        let mut poller = StatusPoller::new(Arc::clone(&backend) as Arc<dyn Backend>, Duration::ZERO);
        poller.start("ses_a");

        poller.tick(Instant::now());
        assert_eq!(poller.current_status("ses_a"), SessionStatus::Idle);

        // Restart attempts and later ticks never resurrect the session.
        poller.start("ses_a");
        assert!(!poller.is_polling("ses_a"));
        poller.tick(Instant::now());
        assert_eq!(poller.current_status("ses_a"), SessionStatus::Idle);
        assert_eq!(backend.query_count(), 1);
    }

    #[test]
    fn stop_all_without_runs_is_noop() {
        let backend = ScriptedBackend::new(vec![]);
        let mut poller = StatusPoller::new(backend, DEFAULT_POLL_INTERVAL);
        poller.stop_all();
        poller.stop_all();
        assert_eq!(poller.current_status("ses_a"), SessionStatus::Idle);
    }

    #[test]
    fn stop_all_halts_polling_but_keeps_cache() {
        let backend = ScriptedBackend::new(vec![busy_map(&["ses_a"])]);
        let mut poller = StatusPoller::new(Arc::clone(&backend) as Arc<dyn Backend>, Duration::ZERO);
        poller.start("ses_a");
        poller.tick(Instant::now());

        poller.stop_all();
        assert!(!poller.is_polling("ses_a"));
        assert_eq!(poller.current_status("ses_a"), SessionStatus::Busy);

        poller.tick(Instant::now());
        assert_eq!(backend.query_count(), 1);
    }
}
