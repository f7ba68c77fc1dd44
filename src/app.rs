//! The batch application: startup, the event loop, and shutdown.
//!
//! Everything funnels into one mpsc channel: server readiness, bridged
//! output chunks, decoded keys, and Ctrl-C. The loop drains events, ticks
//! the sequencer and the bridge flush cadence, and repaints the frame. All
//! timing decisions live in the components; the loop only supplies `now`.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::bridge::{AttachCommand, BridgeEvent, OutputBridge};
use crate::cli::Cli;
use crate::client::{AgentInfo, Backend, HttpBackend, ModelSelection, ProviderInfo, SessionStatus};
use crate::config::ProjectConfig;
use crate::handoff::NativeHandoff;
use crate::log::{ExecutionLog, LogEvent};
use crate::paths;
use crate::poller::StatusPoller;
use crate::sequencer::{RunPlan, RunSequencer, RunStatus, StartOutcome};
use crate::server::{ServerError, ServerEvent, ServerProcess};
use crate::store::ModelStore;
use crate::ui::{self, FooterModel, HeaderModel, InputGate, Key, KeyPress, RunRow, TerminalDisplay};

/// How long the loop sleeps waiting for the next event.
const EVENT_TIMEOUT: Duration = Duration::from_millis(25);

#[derive(Debug)]
enum AppEvent {
    Server(ServerEvent),
    Bridge(BridgeEvent),
    Key(KeyPress),
    Interrupt,
}

fn forward<T, F>(rx: Receiver<T>, tx: Sender<AppEvent>, wrap: F)
where
    T: Send + 'static,
    F: Fn(T) -> AppEvent + Send + 'static,
{
    thread::spawn(move || {
        for item in rx {
            if tx.send(wrap(item)).is_err() {
                return;
            }
        }
    });
}

/// Quit flow: a busy run asks for confirmation first.
#[derive(Debug, Default)]
struct QuitGate {
    confirming: bool,
}

#[derive(Debug, PartialEq)]
enum QuitAction {
    Continue,
    Exit,
}

impl QuitGate {
    fn request(&mut self, any_busy: bool) -> QuitAction {
        if any_busy {
            self.confirming = true;
            QuitAction::Continue
        } else {
            QuitAction::Exit
        }
    }

    fn on_key(&mut self, key: Key) -> QuitAction {
        if !self.confirming {
            return QuitAction::Continue;
        }
        match key {
            Key::Yes | Key::Quit => QuitAction::Exit,
            Key::No | Key::Escape => {
                self.confirming = false;
                QuitAction::Continue
            }
            _ => QuitAction::Continue,
        }
    }
}

/// Pick the model to run with: explicit flag first, then the most recently
/// used model from the shared store.
fn resolve_model(flag: Option<&str>, store: &ModelStore) -> Result<Option<ModelSelection>> {
    if let Some(raw) = flag {
        let selection = ModelSelection::parse(raw).with_context(|| {
            format!("invalid model {raw:?}: expected provider/model, e.g. anthropic/claude-sonnet-4")
        })?;
        return Ok(Some(selection));
    }
    Ok(store.most_recent().and_then(ModelSelection::parse))
}

/// Cross-check the chosen model and agent against the backend catalogs.
/// Returns warnings; an unknown name is passed through to the backend
/// anyway, which has the final say.
fn catalog_warnings(
    providers: &[ProviderInfo],
    agents: &[AgentInfo],
    model: Option<&ModelSelection>,
    agent: Option<&str>,
) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Some(model) = model {
        match providers.iter().find(|p| p.id == model.provider_id) {
            None => {
                warnings.push(format!("provider {:?} not in the catalog", model.provider_id));
            }
            Some(provider) => match provider.models.get(&model.model_id) {
                None => warnings.push(format!(
                    "model {:?} not offered by {}",
                    model.model_id, provider.name
                )),
                Some(info) if info.status.as_deref() == Some("deprecated") => {
                    warnings.push(format!("model {} is deprecated", info.name));
                }
                Some(_) => {}
            },
        }
    }
    if let Some(agent) = agent {
        match agents.iter().find(|a| a.name == agent) {
            None => warnings.push(format!("agent {agent:?} not in the agent catalog")),
            Some(info) if info.mode.as_deref() == Some("subagent") => {
                warnings.push(format!("agent {agent:?} is a subagent, not a primary agent"));
            }
            Some(_) => {}
        }
    }
    warnings
}

/// Footer line for a session the provider is retrying, with a countdown to
/// the next attempt.
fn retry_notice(status: &SessionStatus, now_ms: i64) -> Option<String> {
    match status {
        SessionStatus::Retry {
            attempt,
            message,
            next_attempt_at,
        } => {
            let wait_secs = (*next_attempt_at as i64 - now_ms).max(0) / 1000;
            Some(format!("retry #{attempt} in {wait_secs}s: {message}"))
        }
        _ => None,
    }
}

pub fn run(cli: Cli, config: ProjectConfig, prompt: String, log: Arc<ExecutionLog>) -> Result<()> {
    let (tx, rx) = mpsc::channel::<AppEvent>();

    {
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.send(AppEvent::Interrupt);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let (server_tx, server_rx) = mpsc::channel();
    forward(server_rx, tx.clone(), AppEvent::Server);
    let mut server = ServerProcess::spawn(&config.server, server_tx)?;

    // Block until the server announces its port. Everything downstream
    // needs it.
    let port = loop {
        match rx.recv() {
            Ok(AppEvent::Server(ServerEvent::Ready { port })) => break port,
            Ok(AppEvent::Server(ServerEvent::Eof)) => {
                let code = server.exit_code();
                let _ = log.log(LogEvent::ServerFailed { exit_code: code });
                return Err(ServerError::StartupFailed { code }.into());
            }
            Ok(AppEvent::Interrupt) => {
                server.kill();
                bail!("interrupted while waiting for the server");
            }
            Ok(_) => {}
            Err(_) => bail!("server channel closed before the server became ready"),
        }
    };
    log.log(LogEvent::ServerReady { port })?;

    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(port));

    // Model selection: flag, then the store's most recent. Remember what we
    // chose so the native TUI agrees next time.
    let store_path = paths::model_store_path();
    let mut store = store_path
        .as_deref()
        .map(ModelStore::load)
        .unwrap_or_default();
    let model = resolve_model(cli.model.as_deref(), &store)?;
    if let (Some(model), Some(path)) = (&model, &store_path) {
        info!(
            model = %model,
            favorite = store.is_favorite(&model.to_string()),
            "model selected"
        );
        store.add_recent(&model.to_string());
        if let Err(e) = store.save(path) {
            debug!("model store save failed: {e:#}");
        }
    }

    match (backend.list_providers(), backend.list_agents()) {
        (Ok(providers), Ok(agents)) => {
            for warning in
                catalog_warnings(&providers, &agents, model.as_ref(), cli.agent.as_deref())
            {
                warn!("{warning}");
            }
        }
        (providers, agents) => {
            debug!(
                providers_ok = providers.is_ok(),
                agents_ok = agents.is_ok(),
                "catalog check skipped"
            );
        }
    }

    let gate = InputGate::new();
    let mut display = TerminalDisplay::new(config.layout.sidebar_width, Arc::clone(&gate))?;
    let (pane_cols, pane_rows) = display.pane_size();

    let (bridge_tx, bridge_rx) = mpsc::channel();
    forward(bridge_rx, tx.clone(), AppEvent::Bridge);
    let mut bridge = OutputBridge::new(
        AttachCommand::new(&config.server.attach_program, port),
        bridge_tx,
        Duration::from_millis(config.timing.flush_interval_ms),
        pane_cols,
        pane_rows,
    );

    let poller = StatusPoller::new(
        Arc::clone(&backend),
        Duration::from_millis(config.timing.poll_interval_ms),
    );
    let mut sequencer = RunSequencer::new(
        Arc::clone(&backend),
        poller,
        RunPlan {
            prompt,
            model: model.clone(),
            agent: cli.agent.clone(),
            budget: cli.runs,
        },
        Duration::from_millis(config.timing.settle_delay_ms),
        Arc::clone(&log),
    );
    let handoff = NativeHandoff::new(&config.server.attach_program, port, Arc::clone(&log));

    let (key_tx, key_rx) = mpsc::channel::<KeyPress>();
    forward(key_rx, tx.clone(), AppEvent::Key);
    ui::spawn_stdin_reader(key_tx, Arc::clone(&gate));

    let mut quit = QuitGate::default();
    let mut notice: Option<String> = None;

    if let StartOutcome::Failed { error } = sequencer.start_next(&mut bridge) {
        notice = Some(error);
    }

    info!(port, "batch loop running");
    let result = loop {
        match rx.recv_timeout(EVENT_TIMEOUT) {
            Ok(AppEvent::Server(ServerEvent::Eof)) => {
                let code = server.exit_code();
                let _ = log.log(LogEvent::ServerFailed { exit_code: code });
                let _ = log.log(LogEvent::BatchStopped {
                    reason: "server exited".to_string(),
                });
                break Err(anyhow::anyhow!(
                    "server exited unexpectedly (exit code {code:?})"
                ));
            }
            Ok(AppEvent::Server(ServerEvent::Ready { .. })) => {}
            Ok(AppEvent::Bridge(BridgeEvent::Output { generation, bytes })) => {
                bridge.on_output(generation, bytes, display.pane_mut());
            }
            Ok(AppEvent::Bridge(BridgeEvent::Exited { generation })) => {
                debug!(generation, "attach subprocess exited");
            }
            // Keys decoded before or during a native handoff carry a stale
            // epoch; executing them here would replay input meant for the
            // foreground process.
            Ok(AppEvent::Key(press)) if !gate.admits(press.epoch) => {
                debug!(?press, "dropped stale key");
            }
            Ok(AppEvent::Key(press)) if quit.confirming => {
                if quit.on_key(press.key) == QuitAction::Exit {
                    break Ok(());
                }
            }
            Ok(
                AppEvent::Key(KeyPress {
                    key: Key::Quit | Key::Interrupt,
                    ..
                })
                | AppEvent::Interrupt,
            ) => {
                if quit.request(sequencer.any_busy()) == QuitAction::Exit {
                    break Ok(());
                }
            }
            Ok(AppEvent::Key(KeyPress {
                key: Key::Attach, ..
            })) => {
                let target = bridge
                    .session_id()
                    .map(String::from)
                    .or_else(|| sequencer.current_run().map(|r| r.id.clone()));
                if let Some(session_id) = target {
                    // Blocks the whole loop until the foreground process
                    // exits; polling and auto-advance resume afterwards.
                    if let Err(e) = handoff.run(&session_id, &mut bridge, &mut display) {
                        warn!("native handoff failed: {e:#}");
                        notice = Some(format!("attach failed: {e:#}"));
                    }
                }
            }
            Ok(AppEvent::Key(KeyPress { key: Key::Up, .. })) => {
                let index = sequencer.current_index().saturating_sub(1);
                sequencer.select_run(index, &mut bridge);
            }
            Ok(AppEvent::Key(KeyPress { key: Key::Down, .. })) => {
                let index = sequencer.current_index() + 1;
                sequencer.select_run(index, &mut bridge);
            }
            Ok(AppEvent::Key(_)) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break Ok(()),
        }

        let now = Instant::now();
        match sequencer.tick(now, &mut bridge) {
            Some(StartOutcome::Failed { error }) => notice = Some(error),
            Some(StartOutcome::BudgetExhausted) => {
                notice = Some(format!("budget of {} runs reached", sequencer.budget()));
            }
            _ => {}
        }
        bridge.maybe_flush(now, display.pane_mut());

        let (cols, rows) = ui::terminal_size();
        if (cols, rows) != display.size() {
            display.refresh_size();
            let (pane_cols, pane_rows) = display.pane_size();
            bridge.resize(pane_cols, pane_rows);
        }

        let header = HeaderModel {
            port: Some(port),
            model: model.as_ref().map(ToString::to_string),
            agent: cli.agent.clone(),
            runs: sequencer.runs().len(),
            budget: sequencer.budget().to_string(),
        };
        let rows: Vec<RunRow> = sequencer
            .runs()
            .iter()
            .enumerate()
            .map(|(i, run)| RunRow {
                run_number: run.run_number,
                busy: run.status == RunStatus::Busy,
                selected: i == sequencer.current_index(),
                duration: run.duration,
            })
            .collect();
        let retry = sequencer.current_run().and_then(|run| {
            retry_notice(
                &sequencer.status_of(&run.id),
                chrono::Utc::now().timestamp_millis(),
            )
        });
        let footer = FooterModel {
            quit_confirm: quit.confirming,
            message: notice
                .clone()
                .or(retry)
                .or_else(|| sequencer.last_error().map(String::from)),
        };
        if let Err(e) = display.draw(&header, &rows, &footer) {
            debug!("draw failed: {e}");
        }
    };

    let completed = sequencer
        .runs()
        .iter()
        .filter(|r| r.status == RunStatus::Idle)
        .count();
    bridge.kill();
    sequencer.stop_all();
    server.kill();
    let _ = log.log(LogEvent::BatchEnded {
        runs_completed: completed,
    });
    info!(runs_completed = completed, "batch ended");

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_exits_immediately_when_nothing_is_busy() {
        let mut gate = QuitGate::default();
        assert_eq!(gate.request(false), QuitAction::Exit);
        assert!(!gate.confirming);
    }

    #[test]
    fn quit_confirms_when_a_run_is_busy() {
        let mut gate = QuitGate::default();
        assert_eq!(gate.request(true), QuitAction::Continue);
        assert!(gate.confirming);

        assert_eq!(gate.on_key(Key::Attach), QuitAction::Continue);
        assert_eq!(gate.on_key(Key::Yes), QuitAction::Exit);
    }

    #[test]
    fn quit_confirmation_can_be_cancelled() {
        let mut gate = QuitGate::default();
        gate.request(true);
        assert_eq!(gate.on_key(Key::No), QuitAction::Continue);
        assert!(!gate.confirming);

        gate.request(true);
        assert_eq!(gate.on_key(Key::Escape), QuitAction::Continue);
        assert!(!gate.confirming);
    }

    #[test]
    fn second_quit_press_confirms() {
        let mut gate = QuitGate::default();
        gate.request(true);
        assert_eq!(gate.on_key(Key::Quit), QuitAction::Exit);
    }

    #[test]
    fn explicit_model_flag_wins_over_store() {
        let mut store = ModelStore::default();
        store.add_recent("openai/gpt-5");
        let model = resolve_model(Some("anthropic/claude-sonnet-4"), &store)
            .unwrap()
            .unwrap();
        assert_eq!(model.provider_id, "anthropic");
    }

    #[test]
    fn store_recent_used_without_flag() {
        let mut store = ModelStore::default();
        store.add_recent("openai/gpt-5");
        let model = resolve_model(None, &store).unwrap().unwrap();
        assert_eq!(model.to_string(), "openai/gpt-5");
    }

    #[test]
    fn no_flag_and_empty_store_means_backend_default() {
        let store = ModelStore::default();
        assert!(resolve_model(None, &store).unwrap().is_none());
    }

    #[test]
    fn malformed_model_flag_is_an_error() {
        let store = ModelStore::default();
        assert!(resolve_model(Some("not-a-model"), &store).is_err());
    }

    fn test_providers(sonnet_status: Option<&str>) -> Vec<ProviderInfo> {
        vec![ProviderInfo {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            models: [(
                "claude-sonnet-4".to_string(),
                crate::client::ModelInfo {
                    name: "Claude Sonnet 4".to_string(),
                    status: sonnet_status.map(String::from),
                },
            )]
            .into_iter()
            .collect(),
        }]
    }

    fn test_agents(mode: Option<&str>) -> Vec<AgentInfo> {
        vec![AgentInfo {
            name: "code".to_string(),
            mode: mode.map(String::from),
        }]
    }

    #[test]
    fn catalog_warnings_flag_unknown_names() {
        let providers = test_providers(None);
        let agents = test_agents(None);

        let known = ModelSelection::parse("anthropic/claude-sonnet-4").unwrap();
        assert!(catalog_warnings(&providers, &agents, Some(&known), Some("code")).is_empty());

        let unknown = ModelSelection::parse("anthropic/claude-nonexistent").unwrap();
        let warnings = catalog_warnings(&providers, &agents, Some(&unknown), Some("review"));
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("not offered by Anthropic"));

        let foreign = ModelSelection::parse("nonexistent/model").unwrap();
        let warnings = catalog_warnings(&providers, &agents, Some(&foreign), None);
        assert!(warnings[0].contains("provider \"nonexistent\""));
    }

    #[test]
    fn catalog_warns_on_deprecated_model_and_subagent() {
        let providers = test_providers(Some("deprecated"));
        let agents = test_agents(Some("subagent"));

        let model = ModelSelection::parse("anthropic/claude-sonnet-4").unwrap();
        let warnings = catalog_warnings(&providers, &agents, Some(&model), Some("code"));
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("Claude Sonnet 4 is deprecated"));
        assert!(warnings[1].contains("subagent"));
    }

    #[test]
    fn retry_notice_counts_down_to_the_next_attempt() {
        let status = SessionStatus::Retry {
            attempt: 3,
            message: "overloaded".to_string(),
            next_attempt_at: 10_000,
        };
        assert_eq!(
            retry_notice(&status, 4_000).as_deref(),
            Some("retry #3 in 6s: overloaded")
        );
        // A deadline already in the past clamps to zero.
        assert_eq!(
            retry_notice(&status, 12_000).as_deref(),
            Some("retry #3 in 0s: overloaded")
        );
        assert!(retry_notice(&SessionStatus::Idle, 0).is_none());
        assert!(retry_notice(&SessionStatus::Busy, 0).is_none());
    }
}
