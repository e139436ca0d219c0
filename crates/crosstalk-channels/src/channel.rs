use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::{
    error::ChannelError,
    types::{Envelope, ReplyPayload, ReplyToMode},
};

/// Stream of normalized inbound envelopes produced by an adapter.
pub type InboundStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// Sink for channel-side status signals (typing indicators, delivery
/// failures). The core drives it; adapters render it however the platform
/// allows.
pub trait StatusSink: Send + Sync {
    fn typing_started(&self, conversation: &str);
    fn typing_stopped(&self, conversation: &str);
    fn delivery_failed(&self, conversation: &str, reason: &str);
}

/// No-op sink used until an adapter installs a real one.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn typing_started(&self, _conversation: &str) {}
    fn typing_stopped(&self, _conversation: &str) {}
    fn delivery_failed(&self, _conversation: &str, _reason: &str) {}
}

/// Common interface implemented by every channel adapter.
///
/// Adapters normalize platform messages into [`Envelope`]s on the inbound
/// side and accept [`ReplyPayload`]s on the outbound side. Implementations
/// must be `Send + Sync` so they can be stored in the registry and driven
/// from multiple Tokio tasks.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// The adapter's inbound envelope stream. Called once at registration;
    /// the registry fans all adapter streams into one feed.
    fn inbound(&self) -> InboundStream;

    /// Deliver a single outbound payload. `conversation` is the platform
    /// address the reply targets (chat id, user id, …).
    async fn send(&self, conversation: &str, payload: &ReplyPayload) -> Result<(), ChannelError>;

    /// Install the sink the adapter reports status through (delivery
    /// failures, platform-side typing of the remote user).
    fn set_status_sink(&self, sink: Arc<dyn StatusSink>);

    /// Show or clear the bot's typing indicator on the platform, where it
    /// has one. Default is a no-op.
    async fn set_typing(&self, _conversation: &str, _active: bool) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Threading capability of this platform.
    fn reply_to_mode(&self) -> ReplyToMode {
        ReplyToMode::Any
    }

    /// Hard cap on outbound media, when the platform has one.
    fn max_media_bytes(&self) -> Option<u64> {
        None
    }
}
