//! Output bridge — couples a per-run attach subprocess to the display sink.
//!
//! The sink (terminal pane) becomes attachable asynchronously relative to
//! subprocess spawn, so chunks are queued while the sink is unready and
//! flushed in arrival order the moment it is. A fallback flush cadence
//! covers the case where the sink becomes ready with no new output arriving
//! to trigger delivery. Chunks are tagged with an attach generation; output
//! from a previous attach can never reach the sink.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Where bridged output lands. Implemented by the terminal pane; tests use
/// recording fakes.
pub trait DisplaySink {
    fn is_ready(&self) -> bool;
    fn feed(&mut self, bytes: &[u8]);
}

/// Events emitted by the bridge reader thread.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A chunk of subprocess output, tagged with its attach generation.
    Output { generation: u64, bytes: Vec<u8> },
    /// The subprocess output stream closed.
    Exited { generation: u64 },
}

/// Strictly FIFO buffer between the subprocess and the sink.
///
/// Invariant: the queue is always fully drained before any newer chunk is
/// delivered, so the sink observes chunks in exact arrival order.
struct ChunkBuffer {
    queue: VecDeque<Vec<u8>>,
}

impl ChunkBuffer {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    fn clear(&mut self) {
        self.queue.clear();
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Deliver a new chunk: directly (after draining the queue) when the
    /// sink is ready, buffered otherwise.
    fn deliver(&mut self, bytes: Vec<u8>, sink: &mut dyn DisplaySink) {
        if sink.is_ready() {
            self.flush(sink);
            sink.feed(&bytes);
        } else {
            self.queue.push_back(bytes);
        }
    }

    /// Drain the queue into a ready sink, oldest first.
    fn flush(&mut self, sink: &mut dyn DisplaySink) {
        while let Some(buffered) = self.queue.pop_front() {
            sink.feed(&buffered);
        }
    }
}

/// How to spawn attach subprocesses for a discovered server.
#[derive(Debug, Clone)]
pub struct AttachCommand {
    pub program: String,
    pub base_url: String,
}

impl AttachCommand {
    pub fn new(program: &str, port: u16) -> Self {
        Self {
            program: program.to_string(),
            base_url: format!("http://127.0.0.1:{port}"),
        }
    }

    pub fn args(&self, session_id: &str) -> Vec<String> {
        vec![
            "attach".to_string(),
            self.base_url.clone(),
            "-s".to_string(),
            session_id.to_string(),
        ]
    }

    fn builder(&self, session_id: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        for arg in self.args(session_id) {
            cmd.arg(arg);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd
    }
}

/// Bridges exactly one attach subprocess to the single display sink.
///
/// Attaching a new session is the only way sink ownership transfers: the
/// old subprocess is killed and the queue cleared before the new one is
/// wired, atomically from the caller's perspective.
pub struct OutputBridge {
    command: AttachCommand,
    tx: Sender<BridgeEvent>,
    buffer: ChunkBuffer,
    generation: u64,
    session_id: Option<String>,
    child: Option<Box<dyn Child + Send + Sync>>,
    master: Option<Box<dyn MasterPty + Send>>,
    size: PtySize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl OutputBridge {
    pub fn new(
        command: AttachCommand,
        tx: Sender<BridgeEvent>,
        flush_interval: Duration,
        cols: u16,
        rows: u16,
    ) -> Self {
        Self {
            command,
            tx,
            buffer: ChunkBuffer::new(),
            generation: 0,
            session_id: None,
            child: None,
            master: None,
            size: PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            },
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Session the bridge is currently wired to.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Tear down any existing subprocess, clear the queue, and spawn a new
    /// attach subprocess for `session_id`.
    pub fn attach(&mut self, session_id: &str) -> Result<()> {
        self.kill();
        self.buffer.clear();

        let generation = self.generation;
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(self.size)
            .context("failed to open PTY for attach")?;

        let child = pair
            .slave
            .spawn_command(self.command.builder(session_id))
            .with_context(|| {
                format!("failed to spawn attach process {:?}", self.command.program)
            })?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone attach PTY reader")?;

        info!(session_id, generation, "bridge attached");

        let tx = self.tx.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("attach PTY read error (process likely exited): {e}");
                        break;
                    }
                };
                let event = BridgeEvent::Output {
                    generation,
                    bytes: buf[..n].to_vec(),
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
            let _ = tx.send(BridgeEvent::Exited { generation });
        });

        self.session_id = Some(session_id.to_string());
        self.child = Some(child);
        self.master = Some(pair.master);
        Ok(())
    }

    /// Route a chunk from the reader thread toward the sink. Chunks from a
    /// previous attach generation are dropped.
    pub fn on_output(&mut self, generation: u64, bytes: Vec<u8>, sink: &mut dyn DisplaySink) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "dropping stale bridge chunk");
            return;
        }
        self.buffer.deliver(bytes, sink);
    }

    /// Fallback flush: covers the sink becoming ready while no new output
    /// arrives. Returns true when a flush was performed.
    pub fn maybe_flush(&mut self, now: Instant, sink: &mut dyn DisplaySink) -> bool {
        if now.duration_since(self.last_flush) < self.flush_interval {
            return false;
        }
        self.last_flush = now;
        if sink.is_ready() && !self.buffer.is_empty() {
            self.buffer.flush(sink);
            return true;
        }
        false
    }

    /// Propagate a resize to the active subprocess, or just remember the
    /// size for the next attach.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.size.cols = cols;
        self.size.rows = rows;
        if let Some(master) = &self.master {
            if let Err(e) = master.resize(self.size) {
                debug!("attach PTY resize failed: {e}");
            }
        }
    }

    /// Terminate the active subprocess. Idempotent; in-flight chunks from
    /// the killed process are dropped by the generation bump.
    pub fn kill(&mut self) {
        self.generation += 1;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("attach kill failed (already exited?): {e}");
            }
        }
        self.master = None;
    }
}

impl Drop for OutputBridge {
    fn drop(&mut self) {
        self.kill();
    }
}

impl crate::sequencer::BridgeControl for OutputBridge {
    fn attach(&mut self, session_id: &str) -> Result<()> {
        OutputBridge::attach(self, session_id)
    }

    fn kill(&mut self) {
        OutputBridge::kill(self);
    }
}
