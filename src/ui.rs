//! Terminal frontend: raw mode, key decoding, and the batch view.
//!
//! The view is a thin frame around the bridged session output: a header
//! line, a run sidebar, a key-hint footer, and the pane itself. Bridged
//! bytes are parsed through a vt100 screen so the pane can be repainted in
//! full after a resize or a native handoff, instead of replaying raw
//! output.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::debug;
use unicode_width::UnicodeWidthChar;

use crate::bridge::DisplaySink;
use crate::handoff::DisplaySurface;

/// Rows consumed by the header and footer.
const CHROME_ROWS: u16 = 2;

/// Decoded keyboard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Quit,
    Attach,
    Yes,
    No,
    Escape,
    Up,
    Down,
    Interrupt,
}

/// Decode a raw-mode stdin chunk into keys.
///
/// Arrow keys arrive as complete 3-byte CSI sequences in a single read;
/// anything unrecognized is dropped.
pub fn decode_keys(bytes: &[u8]) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0x1b => {
                if bytes.get(i + 1) == Some(&b'[') {
                    match bytes.get(i + 2) {
                        Some(b'A') => keys.push(Key::Up),
                        Some(b'B') => keys.push(Key::Down),
                        _ => {}
                    }
                    i += 3;
                    continue;
                }
                keys.push(Key::Escape);
            }
            0x03 => keys.push(Key::Interrupt),
            b'q' => keys.push(Key::Quit),
            b'a' => keys.push(Key::Attach),
            b'y' => keys.push(Key::Yes),
            b'n' => keys.push(Key::No),
            b'k' => keys.push(Key::Up),
            b'j' => keys.push(Key::Down),
            _ => {}
        }
        i += 1;
    }
    keys
}

/// A decoded key, stamped with the input epoch it was read under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub epoch: u64,
    pub key: Key,
}

/// Arbitrates stdin ownership between the reader thread and foreground
/// attach processes.
///
/// While suspended, the reader thread must not read the terminal at all so
/// every typed byte reaches the foreground process. Resuming bumps the
/// epoch, which invalidates any key decoded before or during the
/// suspension but not yet handled.
pub struct InputGate {
    suspended: AtomicBool,
    epoch: AtomicU64,
}

impl InputGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            suspended: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether a key stamped with `epoch` should still be acted on.
    pub fn admits(&self, epoch: u64) -> bool {
        !self.is_suspended() && epoch == self.epoch()
    }
}

/// Read stdin on a dedicated thread and forward decoded keys.
///
/// The thread never blocks in `read()`: it waits in `poll` with a short
/// timeout, and rechecks the gate after waking, so a handoff that starts
/// while bytes are pending leaves those bytes for the foreground process.
pub fn spawn_stdin_reader(tx: Sender<KeyPress>, gate: Arc<InputGate>) {
    thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 64];
        loop {
            if gate.is_suspended() {
                thread::sleep(Duration::from_millis(20));
                continue;
            }
            let mut pollfd = libc::pollfd {
                fd: libc::STDIN_FILENO,
                events: libc::POLLIN,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut pollfd, 1, 50) };
            if ready < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                debug!("stdin poll failed: {err}");
                break;
            }
            if ready == 0 || pollfd.revents & libc::POLLIN == 0 {
                continue;
            }
            if gate.is_suspended() {
                continue;
            }
            let n = match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("stdin read failed: {e}");
                    break;
                }
            };
            let epoch = gate.epoch();
            for key in decode_keys(&buf[..n]) {
                if tx.send(KeyPress { epoch, key }).is_err() {
                    return;
                }
            }
        }
    });
}

/// Puts the controlling terminal into raw mode; restores on drop.
pub struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut term) != 0 {
                bail!("tcgetattr failed: {}", std::io::Error::last_os_error());
            }
            let original = term;
            libc::cfmakeraw(&mut term);
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &term) != 0 {
                bail!("tcsetattr failed: {}", std::io::Error::last_os_error());
            }
            Ok(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

/// Current terminal dimensions, with an 80x24 fallback for odd terminals.
pub fn terminal_size() -> (u16, u16) {
    unsafe {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) == 0
            && ws.ws_col > 0
            && ws.ws_row > 0
        {
            (ws.ws_col, ws.ws_row)
        } else {
            (80, 24)
        }
    }
}

/// What the header line shows.
#[derive(Debug, Clone, Default)]
pub struct HeaderModel {
    pub port: Option<u16>,
    pub model: Option<String>,
    pub agent: Option<String>,
    pub runs: usize,
    pub budget: String,
}

/// One sidebar entry.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_number: u32,
    pub busy: bool,
    pub selected: bool,
    pub duration: Option<Duration>,
}

/// What the footer line shows.
#[derive(Debug, Clone, Default)]
pub struct FooterModel {
    pub quit_confirm: bool,
    pub message: Option<String>,
}

/// Truncate and pad to a display-cell width. Wide glyphs (CJK, most emoji)
/// occupy two cells, so clamping by `char` count would break the layout.
fn fit(text: &str, width: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w > width {
            break;
        }
        out.push(ch);
        used += w;
    }
    while used < width {
        out.push(' ');
        used += 1;
    }
    out
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

pub fn render_header(model: &HeaderModel, width: usize) -> String {
    let port = model
        .port
        .map_or_else(|| "starting...".to_string(), |p| format!("port {p}"));
    let mut line = format!("ocloop  {port}  runs {}/{}", model.runs, model.budget);
    if let Some(m) = &model.model {
        line.push_str(&format!("  model {m}"));
    }
    if let Some(a) = &model.agent {
        line.push_str(&format!("  agent {a}"));
    }
    fit(&line, width)
}

pub fn render_sidebar_rows(rows: &[RunRow], width: usize, height: usize) -> Vec<String> {
    let mut lines = Vec::with_capacity(height);
    // Keep the tail visible once runs outgrow the sidebar.
    let skip = rows.len().saturating_sub(height);
    for row in rows.iter().skip(skip) {
        let marker = if row.selected { '>' } else { ' ' };
        let state = if row.busy {
            "busy".to_string()
        } else {
            row.duration.map_or_else(|| "idle".to_string(), format_duration)
        };
        lines.push(fit(&format!("{marker} run {}  {state}", row.run_number), width));
    }
    while lines.len() < height {
        lines.push(" ".repeat(width));
    }
    lines
}

pub fn render_footer(model: &FooterModel, width: usize) -> String {
    let line = if model.quit_confirm {
        "a run is still busy — quit anyway? y/n".to_string()
    } else if let Some(message) = &model.message {
        message.clone()
    } else {
        "q quit  a attach  j/k runs".to_string()
    };
    fit(&line, width)
}

/// The session output pane, backed by a vt100 screen.
pub struct TerminalPane {
    parser: vt100::Parser,
    active: bool,
}

impl TerminalPane {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, 0),
            active: true,
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows, cols);
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }
}

impl DisplaySink for TerminalPane {
    fn is_ready(&self) -> bool {
        self.active
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }
}

/// Owns the real terminal: alternate screen, raw mode, and the frame
/// layout. Suspend/resume hands the terminal to a foreground process and
/// takes it back, repainting the pane from its vt100 screen.
pub struct TerminalDisplay {
    pane: TerminalPane,
    raw: Option<RawModeGuard>,
    gate: Arc<InputGate>,
    sidebar_width: u16,
    cols: u16,
    rows: u16,
}

impl TerminalDisplay {
    pub fn new(sidebar_width: u16, gate: Arc<InputGate>) -> Result<Self> {
        let (cols, rows) = terminal_size();
        let pane = TerminalPane::new(
            cols.saturating_sub(sidebar_width + 1).max(1),
            rows.saturating_sub(CHROME_ROWS).max(1),
        );
        let mut display = Self {
            pane,
            raw: None,
            gate,
            sidebar_width,
            cols,
            rows,
        };
        display.enter()?;
        Ok(display)
    }

    fn enter(&mut self) -> Result<()> {
        let mut out = std::io::stdout().lock();
        // Alternate screen, clear, hide cursor.
        out.write_all(b"\x1b[?1049h\x1b[2J\x1b[?25l")?;
        out.flush()?;
        self.raw = Some(RawModeGuard::new()?);
        self.gate.resume();
        self.pane.set_active(true);
        Ok(())
    }

    fn leave(&mut self) -> Result<()> {
        // Stop the key reader before the terminal is released so a
        // foreground process sees every typed byte.
        self.gate.suspend();
        self.pane.set_active(false);
        self.raw = None;
        let mut out = std::io::stdout().lock();
        out.write_all(b"\x1b[?25h\x1b[?1049l")?;
        out.flush()?;
        Ok(())
    }

    /// Pane dimensions, for sizing the bridge PTY.
    pub fn pane_size(&self) -> (u16, u16) {
        self.pane.size()
    }

    /// Full terminal dimensions as of the last measure.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn pane_mut(&mut self) -> &mut TerminalPane {
        &mut self.pane
    }

    /// Re-measure the terminal and resize the pane.
    pub fn refresh_size(&mut self) -> (u16, u16) {
        let (cols, rows) = terminal_size();
        self.cols = cols;
        self.rows = rows;
        self.pane.resize(
            cols.saturating_sub(self.sidebar_width + 1).max(1),
            rows.saturating_sub(CHROME_ROWS).max(1),
        );
        self.pane_size()
    }

    /// Repaint the whole frame.
    pub fn draw(
        &mut self,
        header: &HeaderModel,
        runs: &[RunRow],
        footer: &FooterModel,
    ) -> Result<()> {
        let mut out = std::io::stdout().lock();
        let width = self.cols as usize;
        let body_rows = self.rows.saturating_sub(CHROME_ROWS) as usize;
        let sidebar = self.sidebar_width as usize;

        write!(out, "\x1b[H\x1b[0m\x1b[7m{}\x1b[0m", render_header(header, width))?;

        let sidebar_lines = render_sidebar_rows(runs, sidebar, body_rows);
        for (i, line) in sidebar_lines.iter().enumerate() {
            write!(out, "\x1b[{};1H\x1b[0m{line}\u{2502}", i + 2)?;
        }

        let (pane_cols, _) = self.pane.size();
        let pane_origin = sidebar + 2;
        for (i, row) in self
            .pane
            .parser
            .screen()
            .rows_formatted(0, pane_cols)
            .enumerate()
        {
            if i >= body_rows {
                break;
            }
            write!(out, "\x1b[{};{}H\x1b[0m\x1b[K", i + 2, pane_origin)?;
            out.write_all(&row)?;
        }

        write!(
            out,
            "\x1b[{};1H\x1b[0m\x1b[7m{}\x1b[0m",
            self.rows,
            render_footer(footer, width)
        )?;
        out.flush()?;
        Ok(())
    }
}

impl DisplaySurface for TerminalDisplay {
    fn suspend(&mut self) -> Result<()> {
        self.leave()
    }

    fn resume(&mut self) -> Result<()> {
        self.enter()
    }
}

impl Drop for TerminalDisplay {
    fn drop(&mut self) {
        let _ = self.leave();
    }
}
