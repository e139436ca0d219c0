use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    channel::ChannelAdapter,
    error::ChannelError,
    types::{Envelope, ReplyPayload},
};

const FAN_IN_CAPACITY: usize = 256;

/// Registry of channel adapters plus the fan-in of their inbound streams.
///
/// The scheduler consumes one merged envelope feed; outbound deliveries are
/// routed back to the owning adapter by channel name.
pub struct ChannelRegistry {
    adapters: DashMap<String, Arc<dyn ChannelAdapter>>,
    inbound_tx: mpsc::Sender<Envelope>,
}

impl ChannelRegistry {
    /// Returns the registry and the receiving end of the merged feed.
    pub fn new() -> (Self, mpsc::Receiver<Envelope>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(FAN_IN_CAPACITY);
        (
            Self {
                adapters: DashMap::new(),
                inbound_tx,
            },
            inbound_rx,
        )
    }

    /// Register an adapter and start pumping its inbound stream into the
    /// merged feed. Replaces any previous adapter with the same name.
    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        use futures_util::StreamExt;

        let name = adapter.name().to_string();
        let mut stream = adapter.inbound();
        let tx = self.inbound_tx.clone();
        let pump_name = name.clone();

        tokio::spawn(async move {
            while let Some(envelope) = stream.next().await {
                if tx.send(envelope).await.is_err() {
                    warn!(channel = %pump_name, "inbound feed closed, stopping pump");
                    break;
                }
            }
            info!(channel = %pump_name, "inbound stream ended");
        });

        self.adapters.insert(name.clone(), adapter);
        info!(channel = %name, "adapter registered");
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(channel).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|e| e.key().clone()).collect()
    }

    /// Deliver an outbound payload on the named channel.
    pub async fn send(
        &self,
        channel: &str,
        conversation: &str,
        payload: &ReplyPayload,
    ) -> Result<(), ChannelError> {
        let adapter = self.get(channel).ok_or_else(|| ChannelError::NotRegistered {
            channel: channel.to_string(),
        })?;
        adapter.send(conversation, payload).await
    }
}
