//! Native terminal handoff.
//!
//! Hands the real terminal to a foreground `opencode attach` process so the
//! user gets full native interactivity, then restores the bridged view when
//! it exits. The protocol is strictly sequential: kill the bridge, suspend
//! the display surface, run the foreground process with inherited stdio,
//! wait for it, resume the surface, re-attach the bridge to the same
//! session. The bridge kill comes first so no bridged bytes can interleave
//! with the foreground process's own output.

use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::log::{ExecutionLog, LogEvent};
use crate::sequencer::BridgeControl;

/// Terminal ownership seam. The pane suspends (restores cooked mode, leaves
/// the alternate screen) before the foreground process runs and resumes
/// (raw mode, repaint) after.
pub trait DisplaySurface {
    fn suspend(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
}

/// Runs foreground attach processes against a discovered server.
pub struct NativeHandoff {
    program: String,
    base_url: String,
    log: Arc<ExecutionLog>,
}

impl NativeHandoff {
    pub fn new(program: &str, port: u16, log: Arc<ExecutionLog>) -> Self {
        Self {
            program: program.to_string(),
            base_url: format!("http://127.0.0.1:{port}"),
            log,
        }
    }

    fn args(&self, session_id: &str) -> Vec<String> {
        vec![
            "attach".to_string(),
            self.base_url.clone(),
            "-s".to_string(),
            session_id.to_string(),
        ]
    }

    /// Hand the terminal to a foreground attach process for `session_id`
    /// and restore the bridged view when it exits.
    ///
    /// Blocks until the foreground process terminates. If it cannot be
    /// spawned, the surface is resumed before the error propagates so the
    /// terminal is never left suspended.
    pub fn run(
        &self,
        session_id: &str,
        bridge: &mut dyn BridgeControl,
        surface: &mut dyn DisplaySurface,
    ) -> Result<()> {
        bridge.kill();
        surface.suspend()?;

        info!(session_id, program = %self.program, "native attach started");
        if let Err(e) = self.log.log(LogEvent::NativeAttachStarted {
            session_id: session_id.to_string(),
        }) {
            warn!("execution log write failed: {e:#}");
        }

        let status = Command::new(&self.program)
            .args(self.args(session_id))
            .status()
            .with_context(|| format!("failed to run attach program {:?}", self.program));

        // Resume and re-attach unconditionally: a spawn failure must not
        // leave the terminal suspended or the viewed run without live
        // output. The session itself is unchanged either way.
        let resumed = surface.resume();
        let reattached = bridge
            .attach(session_id)
            .context("failed to re-attach bridge after native handoff");

        let status = status?;
        resumed?;
        info!(session_id, code = ?status.code(), "native attach ended");
        if let Err(e) = self.log.log(LogEvent::NativeAttachEnded {
            session_id: session_id.to_string(),
        }) {
            warn!("execution log write failed: {e:#}");
        }
        reattached?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_handoff(program: &str) -> (NativeHandoff, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(ExecutionLog::new(&tmp.path().join("batch.jsonl")).unwrap());
        (NativeHandoff::new(program, 4096, log), tmp)
    }

    struct TracingBridge {
        trace: Rc<RefCell<Vec<String>>>,
    }

    impl BridgeControl for TracingBridge {
        fn attach(&mut self, session_id: &str) -> Result<()> {
            self.trace.borrow_mut().push(format!("attach:{session_id}"));
            Ok(())
        }

        fn kill(&mut self) {
            self.trace.borrow_mut().push("kill".to_string());
        }
    }

    struct TracingSurface {
        trace: Rc<RefCell<Vec<String>>>,
    }

    impl DisplaySurface for TracingSurface {
        fn suspend(&mut self) -> Result<()> {
            self.trace.borrow_mut().push("suspend".to_string());
            Ok(())
        }

        fn resume(&mut self) -> Result<()> {
            self.trace.borrow_mut().push("resume".to_string());
            Ok(())
        }
    }

    #[test]
    fn attach_args_target_the_session() {
        let (handoff, _tmp) = test_handoff("opencode");
        assert_eq!(
            handoff.args("ses_abc"),
            vec!["attach", "http://127.0.0.1:4096", "-s", "ses_abc"]
        );
    }

    #[test]
    fn handoff_follows_the_sequential_protocol() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut bridge = TracingBridge {
            trace: Rc::clone(&trace),
        };
        let mut surface = TracingSurface {
            trace: Rc::clone(&trace),
        };

        let (handoff, _tmp) = test_handoff("true");
        handoff.run("ses_a", &mut bridge, &mut surface).unwrap();

        assert_eq!(
            *trace.borrow(),
            vec!["kill", "suspend", "resume", "attach:ses_a"]
        );
    }

    #[test]
    fn spawn_failure_resumes_and_reattaches() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut bridge = TracingBridge {
            trace: Rc::clone(&trace),
        };
        let mut surface = TracingSurface {
            trace: Rc::clone(&trace),
        };

        let (handoff, _tmp) = test_handoff("/nonexistent/attach-program");
        let result = handoff.run("ses_a", &mut bridge, &mut surface);

        // The error surfaces, but the terminal is usable and the viewed
        // run's output keeps streaming.
        assert!(result.is_err());
        assert_eq!(
            *trace.borrow(),
            vec!["kill", "suspend", "resume", "attach:ses_a"]
        );
    }

    #[test]
    fn nonzero_foreground_exit_is_not_an_error() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut bridge = TracingBridge {
            trace: Rc::clone(&trace),
        };
        let mut surface = TracingSurface {
            trace: Rc::clone(&trace),
        };

        let (handoff, _tmp) = test_handoff("false");
        handoff.run("ses_a", &mut bridge, &mut surface).unwrap();
        assert_eq!(trace.borrow().last().map(String::as_str), Some("attach:ses_a"));
    }
}
