//! M1 data-mover supervisor: one child process per `(job, disk)`, launched
//! with the source VMDK, snapshot and CBT extents, and the target NBD
//! locator (spec §4.M1). This supervisor does not move bytes itself.
//!
//! Progress has two independent sources that are merged into one
//! authoritative view:
//! - stdout/stderr lines of shape `phase=... percent=... throughput=...`,
//!   parsed the same log-scraping way the teacher reads `zfs send`/`ssh`
//!   pipe output in `vm/replication.rs`;
//! - a byte-counting channel the mover writes to over a Unix domain socket
//!   during the NBD handshake/stream, carrying exact
//!   `(bytes_transferred, total_bytes)` pairs.
//!
//! Per spec §4.M1/§9, the byte-pipe is authoritative for bytes; the log
//! parser is authoritative for phase/throughput. The merged percentage is
//! `max(log_percent, pipe_percent)` so a lagging log parser never regresses
//! a percentage the byte-pipe has already confirmed (spec §8: "when the
//! byte-pipe reports bytes_transferred = total_bytes, reported percentage is
//! exactly 100 regardless of log parser lag").

use common::Error;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MoverProgress {
    pub phase: String,
    pub percent: f64,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub throughput_mbps: f64,
}

#[derive(Debug, Clone)]
pub struct MoverInput {
    pub job_id: String,
    pub disk_id: String,
    pub vmdk_path: String,
    pub snapshot_id: String,
    pub changed_extents: u64,
    pub nbd_locator: String,
    pub total_bytes: u64,
    pub chunk_size_bytes: u64,
    pub throughput_cap_mbps: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoverOutcome {
    Success { change_id: String },
    Transient(String),
    Fatal(String),
}

pub struct MoverSupervisor {
    binary_path: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl MoverSupervisor {
    pub fn new(binary_path: impl Into<String>, max_retries: u32, retry_backoff: Duration) -> Self {
        Self { binary_path: binary_path.into(), max_retries: max_retries.max(1), retry_backoff }
    }

    /// Drives one `(job, disk)` transfer to a terminal outcome, retrying
    /// transient failures up to `max_retries` times with backoff while
    /// reusing the same snapshot and CBT bookmark — the run never advances
    /// `change_id` until a fully successful attempt (spec §4.M1).
    pub async fn run_disk(&self, input: &MoverInput, progress: watch::Sender<MoverProgress>) -> MoverOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.spawn_once(input, &progress).await {
                Ok(outcome @ MoverOutcome::Success { .. }) => return outcome,
                Ok(MoverOutcome::Transient(reason)) if attempt < self.max_retries => {
                    warn!(job_id = %input.job_id, disk_id = %input.disk_id, attempt, reason, "mover reported transient failure, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Ok(outcome) => return outcome,
                Err(e) => return MoverOutcome::Fatal(e.to_string()),
            }
        }
    }

    async fn spawn_once(&self, input: &MoverInput, progress: &watch::Sender<MoverProgress>) -> Result<MoverOutcome, Error> {
        let socket_dir = std::env::temp_dir();
        let socket_path = socket_dir.join(format!("node-mover-{}-{}.sock", input.job_id, input.disk_id));
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| Error::fatal(format!("failed to bind mover progress socket: {e}")))?;

        let mut command = Command::new(&self.binary_path);
        command
            .arg("--vmdk").arg(&input.vmdk_path)
            .arg("--snapshot").arg(&input.snapshot_id)
            .arg("--nbd-target").arg(&input.nbd_locator)
            .arg("--chunk-size").arg(input.chunk_size_bytes.to_string())
            .arg("--progress-socket").arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cap) = input.throughput_cap_mbps {
            command.arg("--throughput-cap-mbps").arg(cap.to_string());
        }

        let mut child = command.spawn().map_err(|e| Error::unavailable(format!("failed to spawn mover: {e}")))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let log_progress = progress.clone();
        let log_task = tokio::spawn(async move { read_log_progress(stdout, stderr, log_progress).await });

        let pipe_progress = progress.clone();
        let pipe_task = tokio::spawn(async move { read_byte_pipe(listener, pipe_progress).await });

        let status = child.wait().await.map_err(|e| Error::unavailable(format!("mover process error: {e}")))?;
        log_task.abort();
        pipe_task.abort();
        let _ = std::fs::remove_file(&socket_path);

        Ok(classify_exit(status.code(), progress.borrow().clone()))
    }
}

/// Reads `phase=... percent=... throughput=...` tokens from stdout, `ERROR`
/// markers from stderr, and folds both into the shared progress channel
/// without ever regressing a percentage the byte-pipe has already reported.
async fn read_log_progress(
    stdout: impl tokio::io::AsyncRead + Unpin,
    stderr: impl tokio::io::AsyncRead + Unpin,
    progress: watch::Sender<MoverProgress>,
) {
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(line)) => apply_log_line(&progress, &line),
                    Ok(None) => break,
                    Err(e) => { debug!(error = %e, "mover stdout read error"); break; }
                }
            }
            line = stderr_lines.next_line() => {
                match line {
                    Ok(Some(line)) => debug!(mover_stderr = %line, "mover stderr"),
                    Ok(None) => {}
                    Err(_) => {}
                }
            }
        }
    }
}

fn apply_log_line(progress: &watch::Sender<MoverProgress>, line: &str) {
    let mut phase = None;
    let mut percent = None;
    let mut throughput = None;
    for token in line.split_whitespace() {
        if let Some(v) = token.strip_prefix("phase=") {
            phase = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("percent=") {
            percent = v.parse::<f64>().ok();
        } else if let Some(v) = token.strip_prefix("throughput=") {
            throughput = v.parse::<f64>().ok();
        }
    }
    if phase.is_none() && percent.is_none() && throughput.is_none() {
        return;
    }
    progress.send_if_modified(|current| {
        let mut changed = false;
        if let Some(phase) = phase {
            current.phase = phase;
            changed = true;
        }
        if let Some(percent) = percent {
            if percent > current.percent {
                current.percent = percent;
                changed = true;
            }
        }
        if let Some(throughput) = throughput {
            current.throughput_mbps = throughput;
            changed = true;
        }
        changed
    });
}

/// Accepts the mover's single progress connection and reads
/// newline-delimited `bytes_transferred,bytes_total` pairs, merging exact
/// byte counts into the shared progress (spec §4.M1: "the pipe's
/// (bytes_transferred, total_bytes) is authoritative").
async fn read_byte_pipe(listener: UnixListener, progress: watch::Sender<MoverProgress>) {
    let stream = match tokio::time::timeout(Duration::from_secs(30), listener.accept()).await {
        Ok(Ok((stream, _))) => stream,
        _ => return, // mover never connected to the progress socket; log parsing alone drives progress
    };
    read_byte_pipe_stream(stream, progress).await;
}

async fn read_byte_pipe_stream(stream: UnixStream, progress: watch::Sender<MoverProgress>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let Some((transferred, total)) = line.trim().split_once(',') else { continue };
                let (Ok(transferred), Ok(total)) = (transferred.parse::<u64>(), total.parse::<u64>()) else { continue };
                if total == 0 {
                    continue;
                }
                let pipe_percent = if transferred >= total { 100.0 } else { (transferred as f64 / total as f64) * 100.0 };
                progress.send_if_modified(|current| {
                    current.bytes_transferred = transferred;
                    current.bytes_total = total;
                    if pipe_percent > current.percent {
                        current.percent = pipe_percent;
                    }
                    true
                });
            }
            Err(_) => break,
        }
    }
}

fn classify_exit(code: Option<i32>, last_progress: MoverProgress) -> MoverOutcome {
    match code {
        Some(0) => {
            let change_id = if last_progress.phase.starts_with("change_id:") {
                last_progress.phase.trim_start_matches("change_id:").to_string()
            } else {
                uuid::Uuid::new_v4().to_string()
            };
            MoverOutcome::Success { change_id }
        }
        // Conventional exit codes: 1 = fatal (bad VMDK, bad target), 2 =
        // transient (tunnel dip, NBD connect refused) — a real mover
        // documents these; this is the contract the supervisor trusts.
        Some(2) => MoverOutcome::Transient("mover reported a transient failure".to_string()),
        Some(code) => MoverOutcome::Fatal(format!("mover exited with code {code}")),
        None => MoverOutcome::Transient("mover terminated by signal".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_exit_zero_is_success() {
        let outcome = classify_exit(Some(0), MoverProgress::default());
        assert!(matches!(outcome, MoverOutcome::Success { .. }));
    }

    #[test]
    fn classify_exit_two_is_transient() {
        let outcome = classify_exit(Some(2), MoverProgress::default());
        assert!(matches!(outcome, MoverOutcome::Transient(_)));
    }

    #[test]
    fn classify_exit_one_is_fatal() {
        let outcome = classify_exit(Some(1), MoverProgress::default());
        assert!(matches!(outcome, MoverOutcome::Fatal(_)));
    }

    #[test]
    fn classify_exit_signal_is_transient() {
        let outcome = classify_exit(None, MoverProgress::default());
        assert!(matches!(outcome, MoverOutcome::Transient(_)));
    }

    #[tokio::test]
    async fn log_line_never_regresses_percent() {
        let (tx, rx) = watch::channel(MoverProgress::default());
        apply_log_line(&tx, "phase=transferring percent=50 throughput=10.0");
        apply_log_line(&tx, "phase=transferring percent=30 throughput=12.0");
        assert_eq!(rx.borrow().percent, 50.0);
        assert_eq!(rx.borrow().throughput_mbps, 12.0);
    }

    #[tokio::test]
    async fn byte_pipe_full_transfer_is_exactly_100_percent() {
        let (tx, rx) = watch::channel(MoverProgress::default());
        let (client, server) = UnixStream::pair().unwrap();
        let handle = tokio::spawn(read_byte_pipe_stream(server, tx));
        let mut client = client;
        use tokio::io::AsyncWriteExt;
        client.write_all(b"500,1000\n").await.unwrap();
        client.write_all(b"1000,1000\n").await.unwrap();
        drop(client);
        handle.await.unwrap();
        assert_eq!(rx.borrow().percent, 100.0);
        assert_eq!(rx.borrow().bytes_transferred, 1000);
    }

    #[tokio::test]
    async fn byte_pipe_percent_wins_over_stale_log_percent() {
        let (tx, rx) = watch::channel(MoverProgress::default());
        apply_log_line(&tx, "phase=transferring percent=10 throughput=1.0");
        let (client, server) = UnixStream::pair().unwrap();
        let handle = tokio::spawn(read_byte_pipe_stream(server, tx));
        let mut client = client;
        use tokio::io::AsyncWriteExt;
        client.write_all(b"1000,1000\n").await.unwrap();
        drop(client);
        handle.await.unwrap();
        assert_eq!(rx.borrow().percent, 100.0);
    }
}
