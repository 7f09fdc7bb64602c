//! UCI engine session (async I/O)
//!
//! One session owns one engine process and evaluates one position at a time.
//! The protocol state is tracked explicitly; a search cut off by its deadline
//! leaves the session `Evaluating` until the engine's terminal `bestmove` has
//! been drained, and the next call resynchronizes with `isready` first.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

use crate::error::WorkerError;
use crate::models::{EngineSettings, Evaluation, Score};

const QUIT_WAIT: Duration = Duration::from_secs(1);

type EngineReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
type EngineWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready,
    Evaluating,
    Closed,
}

/// How to launch the engine process
#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineTimeouts {
    /// Bound on the whole `uci` .. `readyok` handshake
    pub startup: Duration,
    /// Bound on `isready` .. `readyok` after the handshake
    pub ready: Duration,
    /// How long to wait for `bestmove` after sending `stop`
    pub stop_grace: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(10),
            ready: Duration::from_secs(10),
            stop_grace: Duration::from_millis(500),
        }
    }
}

/// A single engine process speaking UCI
pub struct EngineSession {
    state: SessionState,
    child: Option<Child>,
    writer: EngineWriter,
    lines: EngineReader,
    timeouts: EngineTimeouts,
}

impl EngineSession {
    /// Spawn the engine and complete the UCI handshake within the startup
    /// timeout. The process is killed if startup fails.
    pub async fn open(command: &EngineCommand, timeouts: EngineTimeouts) -> Result<Self, WorkerError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::EngineStartup(format!("Failed to spawn {}: {e}", command.program))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(WorkerError::EngineStartup("engine stdio not captured".into()));
        };

        let mut session = Self::from_transport(Box::new(stdout), Box::new(stdin), timeouts);
        session.child = Some(child);
        session.start().await?;
        Ok(session)
    }

    fn from_transport(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: EngineWriter,
        timeouts: EngineTimeouts,
    ) -> Self {
        Self {
            state: SessionState::Uninitialized,
            child: None,
            writer,
            lines: BufReader::new(reader).lines(),
            timeouts,
        }
    }

    async fn start(&mut self) -> Result<(), WorkerError> {
        let limit = self.timeouts.startup;
        let failure = match timeout(limit, self.handshake()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("handshake did not complete within {limit:?}"),
        };
        self.terminate().await;
        Err(WorkerError::EngineStartup(failure))
    }

    async fn handshake(&mut self) -> Result<(), WorkerError> {
        self.state = SessionState::Handshaking;
        self.send("uci").await?;
        self.wait_for("uciok").await?;

        self.send("setoption name Threads value 1").await?;
        self.send("isready").await?;
        self.wait_for("readyok").await?;

        self.state = SessionState::Ready;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.state, SessionState::Ready | SessionState::Evaluating)
    }

    /// Start a new game: `ucinewgame` and wait for `readyok`.
    pub async fn reset(&mut self) -> Result<(), WorkerError> {
        self.ensure_ready().await?;
        self.send("ucinewgame").await?;
        self.await_ready().await
    }

    /// Evaluate a position until the engine reports `bestmove` or the
    /// deadline passes, whichever comes first. Reaching the deadline is not
    /// an error: the result holds whatever arrived before it.
    pub async fn evaluate(
        &mut self,
        fen: &str,
        settings: &EngineSettings,
        deadline: Instant,
    ) -> Result<Evaluation, WorkerError> {
        self.ensure_ready().await?;
        self.send(&format!("position fen {fen}")).await?;
        self.send(&settings.go_command()).await?;
        self.state = SessionState::Evaluating;

        let mut result = Evaluation::default();
        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            let line = tokio::select! {
                biased;
                _ = &mut expiry => None,
                line = self.next_line() => Some(line?),
            };
            let Some(line) = line else {
                debug!(fen, "Evaluation deadline reached, stopping search");
                self.stop_search().await?;
                return Ok(result);
            };

            if let Some(best_move) = parse_bestmove(&line) {
                result.best_move = best_move;
                self.state = SessionState::Ready;
                return Ok(result);
            }
            if let Some(score) = parse_score(&line) {
                result.score = Some(score);
            }
        }
    }

    /// Send `quit` and wait briefly for the process to exit, killing it
    /// otherwise. Exit problems are logged only.
    pub async fn close(&mut self) {
        if self.state != SessionState::Closed {
            let _ = self.send("quit").await;
        }
        self.state = SessionState::Closed;

        let Some(mut child) = self.child.take() else {
            return;
        };
        match timeout(QUIT_WAIT, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Engine exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for engine exit"),
            Err(_) => {
                warn!("Engine ignored quit, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill engine");
                }
            }
        }
    }

    async fn ensure_ready(&mut self) -> Result<(), WorkerError> {
        match self.state {
            SessionState::Ready => Ok(()),
            // A previous search never acknowledged its stop.
            SessionState::Evaluating => self.await_ready().await,
            _ => Err(WorkerError::EngineNotReady),
        }
    }

    /// `isready` .. `readyok` within the ready timeout. Anything else the
    /// engine still had queued (a late `bestmove`) is skipped.
    async fn await_ready(&mut self) -> Result<(), WorkerError> {
        self.send("isready").await?;
        match timeout(self.timeouts.ready, self.wait_for("readyok")).await {
            Ok(result) => {
                result?;
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(_) => {
                self.mark_closed();
                Err(WorkerError::Engine(format!(
                    "no readyok within {:?}",
                    self.timeouts.ready
                )))
            }
        }
    }

    async fn stop_search(&mut self) -> Result<(), WorkerError> {
        self.send("stop").await?;
        let grace = self.timeouts.stop_grace;
        let drain = async {
            loop {
                let line = self.next_line().await?;
                if parse_bestmove(&line).is_some() {
                    return Ok::<(), WorkerError>(());
                }
            }
        };
        match timeout(grace, drain).await {
            Ok(result) => {
                result?;
                self.state = SessionState::Ready;
            }
            Err(_) => {
                debug!("No bestmove within stop grace, resync on next use");
            }
        }
        Ok(())
    }

    async fn send(&mut self, cmd: &str) -> Result<(), WorkerError> {
        debug!(cmd, "engine <");
        let written = async {
            self.writer.write_all(format!("{cmd}\n").as_bytes()).await?;
            self.writer.flush().await
        }
        .await;
        written.map_err(|e| {
            self.mark_closed();
            WorkerError::Engine(format!("Failed to write to engine: {e}"))
        })
    }

    async fn next_line(&mut self) -> Result<String, WorkerError> {
        match self.lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                debug!(line = %line, "engine >");
                Ok(line)
            }
            Ok(None) => {
                self.mark_closed();
                Err(WorkerError::Engine("engine output closed".into()))
            }
            Err(e) => {
                self.mark_closed();
                Err(WorkerError::Engine(format!("Failed to read from engine: {e}")))
            }
        }
    }

    async fn wait_for(&mut self, expected: &str) -> Result<(), WorkerError> {
        loop {
            if self.next_line().await? == expected {
                return Ok(());
            }
        }
    }

    fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }

    async fn terminate(&mut self) {
        self.mark_closed();
        if let Some(mut child) = self.child.take() {
            let _ = timeout(QUIT_WAIT, child.wait()).await;
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Something that evaluates positions one at a time.
pub trait Evaluator: Send {
    fn reset(&mut self) -> impl Future<Output = Result<(), WorkerError>> + Send;

    fn evaluate(
        &mut self,
        fen: &str,
        settings: &EngineSettings,
        deadline: Instant,
    ) -> impl Future<Output = Result<Evaluation, WorkerError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;

    /// False once the session can no longer accept work.
    fn is_usable(&self) -> bool;
}

impl Evaluator for EngineSession {
    async fn reset(&mut self) -> Result<(), WorkerError> {
        EngineSession::reset(self).await
    }

    async fn evaluate(
        &mut self,
        fen: &str,
        settings: &EngineSettings,
        deadline: Instant,
    ) -> Result<Evaluation, WorkerError> {
        EngineSession::evaluate(self, fen, settings, deadline).await
    }

    async fn close(&mut self) {
        EngineSession::close(self).await
    }

    fn is_usable(&self) -> bool {
        EngineSession::is_usable(self)
    }
}

/// Opens one dedicated session per worker.
pub trait EngineLauncher: Send + Sync + 'static {
    type Session: Evaluator + 'static;

    fn open(&self) -> impl Future<Output = Result<Self::Session, WorkerError>> + Send;
}

/// Launches real engine processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub command: EngineCommand,
    pub timeouts: EngineTimeouts,
}

impl EngineLauncher for ProcessLauncher {
    type Session = EngineSession;

    async fn open(&self) -> Result<EngineSession, WorkerError> {
        EngineSession::open(&self.command, self.timeouts).await
    }
}

/// Parse the score from an info line; cp and mate are mutually exclusive.
fn parse_score(line: &str) -> Option<Score> {
    if !line.starts_with("info") {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    let idx = parts.iter().position(|p| *p == "score")?;
    let value: i32 = parts.get(idx + 2)?.parse().ok()?;
    match *parts.get(idx + 1)? {
        "cp" => Some(Score::Centipawns(value)),
        "mate" => Some(Score::Mate(value)),
        _ => None,
    }
}

/// `Some(move)` for a bestmove line; the inner value is `None` for `(none)`.
fn parse_bestmove(line: &str) -> Option<Option<String>> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "bestmove" {
        return None;
    }
    Some(
        parts
            .next()
            .filter(|mv| *mv != "(none)")
            .map(str::to_string),
    )
}
