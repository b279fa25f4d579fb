//! Experiment subprocess supervisor
//!
//! Runs the rendered experiment script as a child process, tees its output
//! into the run's output file, and optionally demultiplexes finished lines
//! onto the response channel as logging reports. Cancellation delivers
//! SIGHUP, waits out a bounded grace period, then escalates to SIGKILL;
//! the child is always reaped and the output file always closed. The
//! response channel belongs to the caller and is never closed here.

use crate::error::{Result, WorkerError};
use kiln_events::{Report, Severity};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};

/// Line scanner over a mixed output stream
///
/// Buffers raw bytes (1 MiB up front, growing in 0.5 MiB steps) and yields
/// completed lines. Incomplete trailing runes stay buffered until the next
/// write, so multi-byte characters split across reads survive intact.
pub struct LineDemux {
    buf: Vec<u8>,
}

const INITIAL_BUF: usize = 1024 * 1024;
const GROW_BUF: usize = 512 * 1024;

impl LineDemux {
    pub fn new() -> Self {
        LineDemux {
            buf: Vec::with_capacity(INITIAL_BUF),
        }
    }

    fn ensure_room(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        if needed <= self.buf.capacity() {
            return;
        }
        let short = needed - self.buf.capacity();
        let steps = short.div_ceil(GROW_BUF);
        self.buf.reserve_exact(
            self.buf.capacity() + steps * GROW_BUF - self.buf.len(),
        );
    }

    /// Feed raw bytes, returning every line completed by this write
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.ensure_room(data.len());
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop(); // trailing newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Hand back the unterminated tail at end of stream
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(tail)
    }
}

impl Default for LineDemux {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Executor {
    pub executor_id: String,
    /// How long a HUPped process may linger before SIGKILL
    pub grace: Duration,
}

impl Executor {
    pub fn new(executor_id: impl Into<String>) -> Self {
        Executor {
            executor_id: executor_id.into(),
            grace: Duration::from_secs(10),
        }
    }

    /// Run `script` to completion, teeing output into `output_path`
    ///
    /// The child's working directory is the script's parent. A non-zero
    /// exit surfaces as a wrapped error carrying the code; cancellation of
    /// `cancel` surfaces as the cancel cause even if the child then exits
    /// cleanly during the grace period.
    pub async fn run_script(
        &self,
        mut cancel: watch::Receiver<bool>,
        script: &Path,
        output_path: &Path,
        response: Option<mpsc::Sender<Report>>,
        experiment_key: &str,
        run_key: &str,
    ) -> Result<()> {
        let work_dir = script
            .parent()
            .ok_or_else(|| WorkerError::malformed("script path has no parent"))?;
        let output = std::fs::File::create(output_path)?;
        let output = Arc::new(Mutex::new(output));

        let mut child = tokio::process::Command::new("/bin/bash")
            .arg(script)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                WorkerError::io("experiment spawn failed")
                    .with("script", script.display())
                    .with_source(e)
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let pumps = [
            tokio::spawn(pump(
                Box::new(stdout),
                output.clone(),
                response.clone(),
                Severity::Info,
                self.executor_id.clone(),
                run_key.to_string(),
                experiment_key.to_string(),
            )),
            tokio::spawn(pump(
                Box::new(stderr),
                output.clone(),
                response.clone(),
                Severity::Error,
                self.executor_id.clone(),
                run_key.to_string(),
                experiment_key.to_string(),
            )),
        ];

        let far_future = Duration::from_secs(60 * 60 * 24 * 365);
        let mut kill_at = tokio::time::Instant::now() + far_future;
        let mut cancelled = false;
        let mut hard_killed = false;

        let exit = loop {
            tokio::select! {
                status = child.wait() => break status,
                changed = cancel.changed(), if !cancelled => {
                    let _ = changed;
                    cancelled = true;
                    kill_at = tokio::time::Instant::now() + self.grace;
                    if let Some(pid) = child.id() {
                        log::info!("run {} cancelled, sending SIGHUP to {}", run_key, pid);
                        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                            log::warn!("SIGHUP delivery failed: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep_until(kill_at), if cancelled && !hard_killed => {
                    hard_killed = true;
                    log::warn!("run {} ignored SIGHUP for {:?}, killing", run_key, self.grace);
                    if let Err(e) = child.start_kill() {
                        log::warn!("kill failed: {}", e);
                    }
                }
            }
        };

        // Drain the pumps so the output file holds everything the child wrote
        for handle in pumps {
            let _ = handle.await;
        }
        let exit = exit.map_err(|e| WorkerError::io("experiment wait failed").with_source(e))?;

        if cancelled {
            return Err(WorkerError::io("run cancelled")
                .with("run", run_key)
                .with("experiment", experiment_key));
        }

        match exit.code() {
            Some(0) => Ok(()),
            Some(code) => Err(WorkerError::io("experiment exited non-zero")
                .with("exit_code", code)
                .with("experiment", experiment_key)),
            None => Err(WorkerError::io("experiment terminated by signal")
                .with("experiment", experiment_key)),
        }
    }
}

/// Copy one child stream into the output file and the response channel
async fn pump(
    mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    output: Arc<Mutex<std::fs::File>>,
    response: Option<mpsc::Sender<Report>>,
    severity: Severity,
    executor_id: String,
    run_key: String,
    experiment_key: String,
) {
    let mut demux = LineDemux::new();
    let mut chunk = [0u8; 8192];

    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("output pump read failed: {}", e);
                break;
            }
        };

        {
            let mut file = output.lock();
            if let Err(e) = file.write_all(&chunk[..read]) {
                log::warn!("output file write failed: {}", e);
            }
        }

        if let Some(ref tx) = response {
            for line in demux.push(&chunk[..read]) {
                let report =
                    Report::logging(&executor_id, &run_key, &experiment_key, severity, &line);
                if tx.send(report).await.is_err() {
                    // Receiver is gone; keep pumping for the file's sake
                    break;
                }
            }
        }
    }

    if let Some(ref tx) = response {
        if let Some(tail) = demux.flush() {
            let report = Report::logging(&executor_id, &run_key, &experiment_key, severity, &tail);
            let _ = tx.send(report).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_events::ReportPayload;
    use std::fs;

    fn write_script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("runner.sh");
        fs::write(&path, body).unwrap();
        path
    }

    fn idle_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn test_demux_lines_and_partial_tail() {
        let mut demux = LineDemux::new();
        assert!(demux.push(b"epoch 1").is_empty());
        assert_eq!(demux.push(b"/10\nloss 0.5\nepo"), vec!["epoch 1/10", "loss 0.5"]);
        assert_eq!(demux.flush().as_deref(), Some("epo"));
        assert!(demux.flush().is_none());
    }

    #[test]
    fn test_demux_keeps_split_runes_intact() {
        let mut demux = LineDemux::new();
        let text = "метрика: 0.9\n".as_bytes();
        // Feed one byte at a time so every rune is split across writes
        let mut lines = Vec::new();
        for byte in text {
            lines.extend(demux.push(std::slice::from_ref(byte)));
        }
        assert_eq!(lines, vec!["метрика: 0.9"]);
    }

    #[test]
    fn test_demux_strips_crlf() {
        let mut demux = LineDemux::new();
        assert_eq!(demux.push(b"windows line\r\n"), vec!["windows line"]);
    }

    #[tokio::test]
    async fn test_run_collects_output_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "echo starting\necho oops >&2\necho done\n",
        );
        let output_path = dir.path().join("output");
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel) = idle_cancel();

        Executor::new("worker-1")
            .run_script(cancel, &script, &output_path, Some(tx), "expt-1", "run-1")
            .await
            .unwrap();

        let file = fs::read_to_string(&output_path).unwrap();
        assert!(file.contains("starting"));
        assert!(file.contains("oops"));
        assert!(file.contains("done"));

        let mut messages = Vec::new();
        while let Ok(report) = rx.try_recv() {
            if let ReportPayload::Logging { message, severity, .. } = report.payload {
                messages.push((severity, message));
            }
        }
        assert!(messages.contains(&(Severity::Info, "starting".to_string())));
        assert!(messages.contains(&(Severity::Error, "oops".to_string())));

        // stdout ordering is preserved within the stream
        let stdout_lines: Vec<_> = messages
            .iter()
            .filter(|(s, _)| *s == Severity::Info)
            .map(|(_, m)| m.clone())
            .collect();
        assert_eq!(stdout_lines, vec!["starting", "done"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_wrapped_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 3\n");
        let (_cancel_tx, cancel) = idle_cancel();

        let err = Executor::new("worker-1")
            .run_script(
                cancel,
                &script,
                &dir.path().join("output"),
                None,
                "expt-1",
                "run-1",
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(err.context().iter().any(|(k, v)| k == "exit_code" && v == "3"));
    }

    #[tokio::test]
    async fn test_cancel_delivers_hup() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exec sleep 30\n");
        let output_path = dir.path().join("output");
        let (cancel_tx, cancel) = idle_cancel();

        let executor = Executor::new("worker-1");
        let run = tokio::spawn(async move {
            executor
                .run_script(cancel, &script, &output_path, None, "expt-1", "run-1")
                .await
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel_tx.send(true).unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(format!("{}", err).contains("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_escalates_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        // The child ignores SIGHUP, forcing the SIGKILL path
        let script = write_script(dir.path(), "trap '' HUP\nexec sleep 30\n");
        let output_path = dir.path().join("output");
        let (cancel_tx, cancel) = idle_cancel();

        let mut executor = Executor::new("worker-1");
        executor.grace = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let run = tokio::spawn(async move {
            executor
                .run_script(cancel, &script, &output_path, None, "expt-1", "run-1")
                .await
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel_tx.send(true).unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(started.elapsed() < Duration::from_secs(10), "SIGKILL never fired");
    }
}
