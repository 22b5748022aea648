//! T3 progress bus: a volatile in-memory fan-out from the data-mover
//! supervisor (relayed here from the Node over the control API) to UI
//! subscribers. No durability is promised — the authoritative post-hoc
//! record is the terminal job row and the CBT history (spec §4.T3).

use common::ProgressUpdate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 256;

/// One broadcast channel per job, created lazily on first publish or
/// subscribe and dropped once the job's last subscriber disconnects and a
/// sweep reclaims it (mirrors the pack's per-job event-channel idiom for
/// disaster-recovery progress fan-out).
pub struct ProgressBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ProgressUpdate>>>>,
    last: Arc<RwLock<HashMap<String, ProgressUpdate>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self { channels: Arc::new(RwLock::new(HashMap::new())), last: Arc::new(RwLock::new(HashMap::new())) }
    }

    async fn sender_for(&self, job_id: &str) -> broadcast::Sender<ProgressUpdate> {
        let mut channels = self.channels.write().await;
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub async fn publish(&self, update: ProgressUpdate) {
        self.last.write().await.insert(update.job_id.clone(), update.clone());
        let sender = self.sender_for(&update.job_id).await;
        // No subscribers is not an error: the UI may simply not be watching.
        let _ = sender.send(update);
    }

    pub async fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressUpdate> {
        self.sender_for(job_id).await.subscribe()
    }

    pub async fn last(&self, job_id: &str) -> Option<ProgressUpdate> {
        self.last.read().await.get(job_id).cloned()
    }

    pub async fn forget(&self, job_id: &str) {
        self.channels.write().await.remove(job_id);
        self.last.write().await.remove(job_id);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_sees_last_snapshot() {
        let bus = ProgressBus::new();
        bus.publish(ProgressUpdate {
            job_id: "job-1".into(),
            phase: "transferring".into(),
            percent: 42.0,
            bytes_transferred: 420,
            bytes_total: 1000,
            throughput_mbps: 12.5,
            eta_seconds: Some(60),
            error: None,
        })
        .await;
        assert_eq!(bus.last("job-1").await.unwrap().percent, 42.0);
    }

    #[tokio::test]
    async fn live_subscriber_receives_subsequent_updates() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe("job-2").await;
        bus.publish(ProgressUpdate {
            job_id: "job-2".into(),
            phase: "transferring".into(),
            percent: 10.0,
            bytes_transferred: 10,
            bytes_total: 100,
            throughput_mbps: 1.0,
            eta_seconds: None,
            error: None,
        })
        .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.percent, 10.0);
    }
}
