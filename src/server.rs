//! Backend server supervision.
//!
//! Spawns `opencode serve` in a PTY, watches its unstructured output for the
//! `listening on http://<host>:<port>` line, and reports readiness exactly
//! once. If the process exits before the line appears, startup failed and
//! the exit code is surfaced; a crashed backend cannot serve anything, so
//! there is no retry.

use std::io::Read;
use std::sync::mpsc::Sender;
use std::thread;

use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

/// Keep only this much of the discovery buffer; the listening line shows up
/// in the first few lines of output.
const DISCOVERY_BUFFER_CAP: usize = 8 * 1024;

/// Fatal startup failure of the backend server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server exited before becoming ready (exit code {code:?})")]
    StartupFailed { code: Option<u32> },
}

/// Events emitted by the server reader thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The listening port was discovered. Sent at most once.
    Ready { port: u16 },
    /// Output stream closed — the server process exited.
    Eof,
}

/// Accumulating matcher for the server's listening line.
///
/// Chunks are appended to a rolling buffer so a match spanning chunk
/// boundaries is still found. The unready→ready transition fires exactly
/// once; later matches are ignored.
pub struct EndpointDiscovery {
    pattern: Regex,
    buffer: String,
    port: Option<u16>,
}

impl EndpointDiscovery {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"listening on http://[^:\s]+:(\d+)").unwrap(),
            buffer: String::new(),
            port: None,
        }
    }

    /// Feed a chunk of server output. Returns the port on the first
    /// successful match, `None` otherwise.
    pub fn observe(&mut self, chunk: &str) -> Option<u16> {
        if self.port.is_some() {
            return None;
        }

        self.buffer.push_str(chunk);

        // One chunk can carry several listening lines. Scan past each bogus
        // match so a valid line later in the same chunk is found now, not on
        // the next read.
        loop {
            let (found, invalid_match_end) = match self.pattern.captures(&self.buffer) {
                Some(caps) => {
                    let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                    match raw.parse::<u32>() {
                        Ok(port @ 1..=65535) => (Some(port as u16), None),
                        _ => {
                            warn!(raw = %raw, "discarding listening line with invalid port");
                            (None, caps.get(0).map(|m| m.end()))
                        }
                    }
                }
                None => (None, None),
            };

            if let Some(port) = found {
                self.port = Some(port);
                self.buffer.clear();
                return Some(port);
            }

            match invalid_match_end {
                // The match is non-empty, so every pass shrinks the buffer.
                Some(end) => {
                    self.buffer.drain(..end);
                }
                None => break,
            }
        }

        if self.buffer.len() > DISCOVERY_BUFFER_CAP {
            let excess = self.buffer.len() - DISCOVERY_BUFFER_CAP;
            let cut = self
                .buffer
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= excess)
                .unwrap_or(0);
            self.buffer.drain(..cut);
        }

        None
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_ready(&self) -> bool {
        self.port.is_some()
    }
}

impl Default for EndpointDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the supervised server subprocess.
pub struct ServerProcess {
    child: Box<dyn Child + Send + Sync>,
    // Held so the PTY stays open for the lifetime of the server.
    _master: Box<dyn MasterPty + Send>,
    killed: bool,
}

impl ServerProcess {
    /// Spawn the server in a PTY and start the discovery reader thread.
    ///
    /// Events flow to `tx`: `Ready { port }` at most once, then `Eof` when
    /// the output stream closes.
    pub fn spawn(config: &ServerConfig, tx: Sender<ServerEvent>) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY for server")?;

        let mut cmd = CommandBuilder::new(&config.program);
        for arg in &config.args {
            cmd.arg(arg);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        info!(program = %config.program, args = ?config.args, "spawning server");

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn server process {:?}", config.program))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone server PTY reader")?;

        thread::spawn(move || {
            let mut discovery = EndpointDiscovery::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("server PTY read error (process likely exited): {e}");
                        break;
                    }
                };

                if !discovery.is_ready() {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    if let Some(port) = discovery.observe(&chunk) {
                        info!(port, "server ready");
                        if tx.send(ServerEvent::Ready { port }).is_err() {
                            return;
                        }
                    }
                }
            }
            debug!(port = ?discovery.port(), "server output stream closed");
            let _ = tx.send(ServerEvent::Eof);
        });

        Ok(Self {
            child,
            _master: pair.master,
            killed: false,
        })
    }

    /// Wait for the exited process and return its exit code.
    ///
    /// Call after observing `ServerEvent::Eof`; blocks otherwise.
    pub fn exit_code(&mut self) -> Option<u32> {
        self.child.wait().ok().map(|status| status.exit_code())
    }

    /// Terminate the server. Idempotent.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        if let Err(e) = self.child.kill() {
            debug!("server kill failed (already exited?): {e}");
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}
