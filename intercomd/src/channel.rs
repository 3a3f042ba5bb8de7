//! Messaging channel adapter interface (SPEC_FULL.md §6/§6a).
//!
//! A `Channel` is the one seam the orchestrator core has onto the outside
//! messaging world. Telegram is the reference implementation; a second
//! channel must be pluggable here without any change to the cursor engine,
//! GroupQueue, or IPC watcher.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

/// A single inbound message handed to the core by a channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
}

pub type OnMessage =
    Box<dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Adapter boundary between the core and one messaging surface.
///
/// `ownsJid` lets the router dispatch an outbound `sendMessage` to the right
/// channel when more than one is registered; only one channel is shipped in
/// this build (Telegram), but the trait does not assume that.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel implementation name, for logging.
    fn name(&self) -> &str;

    /// True if this channel is configured and ready to use.
    fn is_enabled(&self) -> bool;

    /// True if `jid` belongs to this channel's address space.
    fn owns_jid(&self, jid: &str) -> bool;

    /// Establishes the connection (e.g. validates a bot token). Idempotent.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Tears down the connection. Idempotent.
    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Sends `text` to `chat_jid`, chunking as the channel's own transport
    /// requires. Returns once all chunks have been accepted by the transport.
    async fn send_message(&self, chat_jid: &str, text: &str) -> anyhow::Result<()>;

    /// Optional typing indicator; channels without one are a no-op.
    async fn set_typing(&self, _chat_jid: &str, _typing: bool) -> anyhow::Result<()> {
        Ok(())
    }
}
