use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::models::ConsultationEvent;

/// Queue depth per channel; events for a client that lags this far behind are
/// dropped rather than blocking turn processing.
const CHANNEL_CAPACITY: usize = 256;

struct ChannelEntry {
    sender: mpsc::Sender<ConsultationEvent>,
    generation: u64,
}

/// Registry of live push channels, at most one per session. Opening a channel
/// for a session that already has one replaces it; the orphaned receiver's
/// stream simply ends. Pushing is best-effort and never fails the caller.
pub struct StreamingGateway {
    channels: Arc<RwLock<HashMap<String, ChannelEntry>>>,
    generations: Arc<AtomicU64>,
    channel_ttl: Duration,
}

impl StreamingGateway {
    pub fn new(channel_ttl: Duration) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            channel_ttl,
        }
    }

    /// Registers a channel for `session_id` and hands back its receiving end.
    /// A watchdog closes the channel with a terminal error event once the
    /// lifetime bound elapses; the generation guard keeps an expired watchdog
    /// from tearing down a replacement channel.
    pub async fn open(&self, session_id: &str) -> mpsc::Receiver<ConsultationEvent> {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        {
            let mut channels = self.channels.write().await;
            if channels
                .insert(session_id.to_string(), ChannelEntry { sender, generation })
                .is_some()
            {
                debug!("Replaced existing channel for session {}", session_id);
            }
        }

        let gateway = self.clone();
        let watched_session = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(gateway.channel_ttl).await;
            gateway.expire(&watched_session, generation).await;
        });

        receiver
    }

    /// Best-effort delivery to whatever channel is currently registered for
    /// the session. A missing channel is a no-op (nobody is listening); a
    /// closed one is deregistered. Turn processing never observes a failure.
    pub async fn push(&self, session_id: &str, event: ConsultationEvent) {
        let send_result = {
            let channels = self.channels.read().await;
            channels
                .get(session_id)
                .map(|entry| entry.sender.try_send(event))
        };

        match send_result {
            None | Some(Ok(())) => {}
            Some(Err(mpsc::error::TrySendError::Full(_))) => {
                warn!(
                    "Channel for session {} is full, dropping event for lagging client",
                    session_id
                );
            }
            Some(Err(mpsc::error::TrySendError::Closed(_))) => {
                debug!(
                    "Client for session {} disconnected, tearing down channel",
                    session_id
                );
                self.close(session_id).await;
            }
        }
    }

    /// Deregisters the channel; dropping the sender ends the client's stream.
    pub async fn close(&self, session_id: &str) {
        let mut channels = self.channels.write().await;
        if channels.remove(session_id).is_some() {
            debug!("Closed channel for session {}", session_id);
        }
    }

    pub async fn has_channel(&self, session_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.contains_key(session_id)
    }

    async fn expire(&self, session_id: &str, generation: u64) {
        let expired = {
            let mut channels = self.channels.write().await;
            match channels.get(session_id) {
                Some(entry) if entry.generation == generation => channels.remove(session_id),
                _ => None,
            }
        };

        if let Some(entry) = expired {
            warn!(
                "Channel for session {} reached its lifetime bound, closing",
                session_id
            );
            let _ = entry.sender.try_send(ConsultationEvent::Error {
                message: "channel lifetime exceeded, reconnect to resume".to_string(),
                session_id: session_id.to_string(),
            });
        }
    }
}

impl Clone for StreamingGateway {
    fn clone(&self) -> Self {
        Self {
            channels: Arc::clone(&self.channels),
            generations: Arc::clone(&self.generations),
            channel_ttl: self.channel_ttl,
        }
    }
}
