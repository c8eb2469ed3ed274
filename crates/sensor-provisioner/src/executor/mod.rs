pub mod pipeline;

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::log_scrub::Scrubber;

pub use pipeline::{
    BuildTool, CommandTool, PipelineRequest, PipelineRun, PipelineState, Requested, execute,
};

const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Clean,
    InstallProfile,
    Compile,
    Upload,
}

/// What a stage failure does to the rest of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePolicy {
    /// Failures are logged as warnings and the pipeline continues.
    BestEffort,
    /// The first failure aborts every remaining stage.
    Fatal,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Clean,
        StageKind::InstallProfile,
        StageKind::Compile,
        StageKind::Upload,
    ];

    pub fn id(self) -> &'static str {
        match self {
            StageKind::Clean => "clean",
            StageKind::InstallProfile => "profile",
            StageKind::Compile => "compile",
            StageKind::Upload => "upload",
        }
    }

    pub fn policy(self) -> StagePolicy {
        match self {
            StageKind::Clean => StagePolicy::BestEffort,
            _ => StagePolicy::Fatal,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Clean => "clean stage",
            StageKind::InstallProfile => "profile install stage",
            StageKind::Compile => "compile stage",
            StageKind::Upload => "upload stage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    /// Completed under a best-effort policy with recovered failures.
    Warned(Vec<String>),
    Failed(String),
    /// Not run because an earlier fatal stage failed.
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Succeeded => "ok",
            StageStatus::Warned(_) => "warned",
            StageStatus::Failed(_) => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub status: StageStatus,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    StageStarted {
        stage: StageKind,
    },
    StageLog {
        stage: StageKind,
        line: String,
    },
    StageFinished {
        outcome: StageOutcome,
    },
    PipelineDone {
        device: String,
        ok: bool,
        error: Option<String>,
        dry_run: bool,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Prints tool output as `[stage] line` and a run summary when the pipeline ends.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    log_lines: usize,
    outcomes: BTreeMap<StageKind, StageOutcome>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::StageStarted { stage } => {
                if let Ok(mut s) = self.state.lock()
                    && s.started_at.is_none()
                {
                    s.started_at = Some(Instant::now());
                }
                println!("RUN: {}", stage.id());
            }
            ExecEvent::StageLog { stage, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                }
                println!("[{}] {line}", stage.id());
            }
            ExecEvent::StageFinished { outcome } => {
                let id = outcome.stage.id();
                let ms = outcome.elapsed_ms;
                match &outcome.status {
                    StageStatus::Succeeded => println!("DONE: {id} ({ms}ms)"),
                    StageStatus::Warned(w) => {
                        println!("DONE: {id} ({ms}ms) with {} warning(s)", w.len())
                    }
                    StageStatus::Failed(e) => println!("FAIL: {id} ({ms}ms) {e}"),
                    StageStatus::Skipped => println!("SKIP: {id}"),
                }
                if let Ok(mut s) = self.state.lock() {
                    s.outcomes.insert(outcome.stage, outcome);
                }
            }
            ExecEvent::PipelineDone {
                device,
                ok,
                error,
                dry_run,
            } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  device: {device}\n"));
                summary.push_str(&format!(
                    "  status: {}{}\n",
                    if ok { "ok" } else { "failed" },
                    if dry_run { " (dry run)" } else { "" }
                ));
                for o in s.outcomes.values() {
                    summary.push_str(&format!(
                        "  {:<8} {:<8} {}\n",
                        o.stage.id(),
                        o.status.as_str(),
                        format_elapsed_hms((o.elapsed_ms / 1000) as u64)
                    ));
                }
                summary.push_str(&format!("  logs: {}\n", s.log_lines));
                summary.push_str(&format!(
                    "  elapsed: {}\n",
                    format_elapsed_hms(wall.as_secs())
                ));
                if let Some(e) = error.filter(|_| !ok) {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                print!("{summary}");
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_stage: Option<StageKind>,
    scrubber: Arc<Scrubber>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_stage: None,
            scrubber: Arc::new(Scrubber::default()),
        }
    }

    /// Redacts these values from every line passed to [`ExecCtx::log`].
    pub fn with_secrets<'a>(mut self, secrets: impl IntoIterator<Item = &'a str>) -> Self {
        self.scrubber = Arc::new(Scrubber::new(secrets));
        self
    }

    pub fn set_stage(&mut self, stage: StageKind) {
        self.current_stage = Some(stage);
    }

    pub fn log(&self, msg: &str) {
        let line = self.scrubber.scrub(msg);
        if line.is_empty() {
            return;
        }
        match self.current_stage {
            Some(stage) => self.sink.emit(ExecEvent::StageLog { stage, line }),
            None => debug!("{line}"),
        }
    }

    /// Runs `cmd` for `stage`, streaming its output line by line through the sink.
    ///
    /// The child gets its own process group so a timeout can terminate the whole subtree.
    /// A non-zero exit maps to [`Error::ExternalToolFailure`], an expired deadline to
    /// [`Error::StageTimeout`].
    pub fn run_cmd(&self, stage: StageKind, mut cmd: Command, timeout: Option<Duration>) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd
            // A child in its own process group that reads the controlling TTY gets SIGTTIN.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn '{program}' for {stage}: {e}")))?;
        let pgid = child.id();
        debug!(%stage, pid = pgid, "spawned {program}");

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            let scrubber = Arc::clone(&self.scrubber);
            std::thread::spawn(move || read_output_stream(out, tx, &scrubber));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            let scrubber = Arc::clone(&self.scrubber);
            std::thread::spawn(move || read_output_stream(err, tx, &scrubber));
        }
        drop(tx);

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        loop {
            let next = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    rx.recv_timeout(remaining)
                }
                None => rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(line) => self.log(&line),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    terminate(&mut child, pgid);
                    break;
                }
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::io(format!("failed to wait for '{program}'"), e))?;
        // Output written before the kill is still worth showing.
        for line in rx.try_iter() {
            self.log(&line);
        }

        if timed_out {
            let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
            warn!(%stage, secs, "terminated {program} after timeout");
            return Err(Error::StageTimeout { stage, secs });
        }
        if !status.success() {
            return Err(Error::ExternalToolFailure {
                stage,
                code: status.code(),
            });
        }
        Ok(())
    }
}

fn terminate(child: &mut Child, pgid: u32) {
    kill_pgroup(pgid, false);
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    // Stragglers in the group may outlive the leader.
    kill_pgroup(pgid, true);
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

const MAX_PENDING_BYTES: usize = 16 * 1024;

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>, scrubber: &Scrubber) {
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send(line);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush_oversized(&mut pending, scrubber, &tx);
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(line);
    }
}

/// Emits an over-long run of output without a newline. Secrets are redacted first and a tail
/// that may be the start of a secret stays pending, so no secret is split across two lines.
fn flush_oversized(pending: &mut Vec<u8>, scrubber: &Scrubber, tx: &mpsc::Sender<String>) {
    let redacted = scrubber.redact(&String::from_utf8_lossy(pending));
    let mut half = redacted.len() / 2;
    while !redacted.is_char_boundary(half) {
        half += 1;
    }
    let keep_from = scrubber.partial_secret_start(&redacted).max(half);
    let (head, tail) = redacted.split_at(keep_from);
    let _ = tx.send(head.to_string());
    *pending = tail.as_bytes().to_vec();
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_ctx() -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));
        ctx.set_stage(StageKind::Compile);
        (ctx, rx)
    }

    fn logged_lines(rx: &mpsc::Receiver<ExecEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|ev| match ev {
                ExecEvent::StageLog { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn policies_per_stage() {
        assert_eq!(StageKind::Clean.policy(), StagePolicy::BestEffort);
        for stage in [StageKind::InstallProfile, StageKind::Compile, StageKind::Upload] {
            assert_eq!(stage.policy(), StagePolicy::Fatal);
        }
        assert_eq!(StageKind::Compile.to_string(), "compile stage");
    }

    #[test]
    fn elapsed_is_formatted_as_hms() {
        assert_eq!(format_elapsed_hms(0), "00:00:00");
        assert_eq!(format_elapsed_hms(3723), "01:02:03");
    }

    #[test]
    fn reader_splits_on_cr_and_lf() {
        let (tx, rx) = mpsc::channel();
        read_output_stream(&b"one\r\ntwo\rthree"[..], tx, &Scrubber::default());
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec!["one", "two", "three"]);
    }

    #[test]
    fn oversized_output_never_splits_a_secret() {
        let secret = "tok-secret-123";
        let scrubber = Scrubber::new([secret]);
        let filler = "x".repeat(MAX_PENDING_BYTES - 5);
        let input = format!("{filler}{secret} done\n");
        let (tx, rx) = mpsc::channel();
        read_output_stream(input.as_bytes(), tx, &scrubber);

        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], filler);
        assert_eq!(lines[1], format!("{secret} done"));
        for line in &lines {
            assert!(!scrubber.scrub(line).contains("tok-se"));
        }
    }

    #[test]
    fn oversized_output_is_redacted_before_it_is_cut() {
        let secret = "tok-secret-123";
        let scrubber = Scrubber::new([secret]);
        let filler = "x".repeat(MAX_PENDING_BYTES - 20);
        let input = format!("{filler}{secret}{}\n", "y".repeat(100));
        let (tx, rx) = mpsc::channel();
        read_output_stream(input.as_bytes(), tx, &scrubber);

        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{filler}[redacted]yyyyyy"));
        assert_eq!(lines[1], "y".repeat(94));
    }

    #[test]
    fn log_redacts_secrets() {
        let (ctx, rx) = collecting_ctx();
        let ctx = ctx.with_secrets(["s3cret"]);
        ctx.log("token is s3cret\u{1b}[0m");
        assert_eq!(logged_lines(&rx), vec!["token is [redacted]"]);
    }

    #[test]
    fn dry_run_does_not_spawn() {
        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)));
        ctx.set_stage(StageKind::Upload);
        let cmd = Command::new("/definitely/not/a/real/tool");
        ctx.run_cmd(StageKind::Upload, cmd, None).unwrap();
        let lines = logged_lines(&rx);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("DRY-RUN:"), "{lines:?}");
    }

    #[cfg(unix)]
    #[test]
    fn streams_output_and_reports_exit_code() {
        let (ctx, rx) = collecting_ctx();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let err = ctx.run_cmd(StageKind::Compile, cmd, None).unwrap_err();
        assert!(
            matches!(
                err,
                Error::ExternalToolFailure {
                    stage: StageKind::Compile,
                    code: Some(3)
                }
            ),
            "unexpected err: {err}"
        );
        let mut lines = logged_lines(&rx);
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_process_group() {
        let (ctx, rx) = collecting_ctx();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo started; sleep 30 & wait"]);
        let start = Instant::now();
        let err = ctx
            .run_cmd(StageKind::Compile, cmd, Some(Duration::from_millis(300)))
            .unwrap_err();
        assert!(
            matches!(err, Error::StageTimeout { stage: StageKind::Compile, .. }),
            "unexpected err: {err}"
        );
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(logged_lines(&rx), vec!["started"]);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let (ctx, _rx) = collecting_ctx();
        let err = ctx
            .run_cmd(
                StageKind::Compile,
                Command::new("/definitely/not/a/real/tool"),
                None,
            )
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"), "{err}");
    }
}
