//! Inbound message routing and startup recovery (SPEC_FULL.md §4.2).
//!
//! Message arrival is event-driven: a `Channel` persists an inbound message
//! then calls [`route_inbound_message`] directly from its `on_message`
//! callback — there is no polling loop over the store. This module also
//! builds the trigger regex shared with `process_group.rs` and runs the
//! crash-recovery scan at startup.

use intercom_core::store::{Store, now_iso};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::channel::InboundMessage;
use crate::queue::GroupQueue;

#[derive(Debug, Clone)]
pub struct MessageLoopConfig {
    pub assistant_name: String,
    pub main_group_folder: String,
}

/// Build a trigger regex matching `@AssistantName` at the start of a message,
/// case-insensitively, plus an optional group-specific custom trigger.
pub fn build_trigger_regex(assistant_name: &str, custom_trigger: Option<&str>) -> Regex {
    let escaped = regex::escape(assistant_name);
    let pattern = match custom_trigger {
        Some(trigger) if !trigger.is_empty() => {
            format!(r"(?i)^@{escaped}\b|^{}\b", regex::escape(trigger))
        }
        _ => format!(r"(?i)^@{escaped}\b"),
    };
    Regex::new(&pattern)
        .unwrap_or_else(|_| Regex::new(&format!(r"(?i)^@{escaped}")).expect("fallback regex"))
}

/// Formats a batch of messages into the prompt envelope handed to the agent.
pub fn format_messages(messages: &[intercom_core::store::NewMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}", m.sender_name, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Routes one freshly-persisted inbound message into the GroupQueue.
///
/// If an agent is already live for this chat, the message is piped directly
/// (SPEC_FULL.md §4.2, "follow-up-while-running") and both cursors advance
/// optimistically. Otherwise a "group needs work" signal is pushed and
/// `process_group_messages` will pick the message up from the store, running
/// its own trigger check.
pub async fn route_inbound_message(
    store: &Store,
    queue: &GroupQueue,
    config: &MessageLoopConfig,
    msg: &InboundMessage,
) -> anyhow::Result<()> {
    if store
        .get_registered_group(&msg.chat_jid)
        .await?
        .is_none()
    {
        debug!(chat_jid = msg.chat_jid.as_str(), "message from unregistered chat, ignored");
        return Ok(());
    }

    store.set_router_state("last_timestamp", &msg.timestamp).await?;

    let envelope = format!("[{}]: {}", msg.sender_name, msg.content);
    if queue.send_message(&msg.chat_jid, &envelope).await {
        store.set_pending_cursor(&msg.chat_jid, &msg.timestamp).await?;
        store.set_agent_cursor(&msg.chat_jid, &msg.timestamp).await?;
        debug!(chat_jid = msg.chat_jid.as_str(), "message piped to live agent");
    } else {
        queue.enqueue_message_check(&msg.chat_jid).await;
    }

    let _ = &config.assistant_name;
    Ok(())
}

/// Startup recovery (SPEC_FULL.md §4.2): clear every pending cursor left by a
/// crashed run, then re-enqueue a message check for any registered group with
/// messages newer than its confirmed agent cursor.
pub async fn recover_pending_cursors(store: &Store, queue: &GroupQueue) -> anyhow::Result<()> {
    let pending = store.get_all_pending_cursors().await?;
    for jid in pending.keys() {
        warn!(chat_jid = jid.as_str(), "clearing pending cursor left by crashed run");
        store.clear_pending_cursor(jid).await?;
    }

    let groups = store.get_all_registered_groups().await?;
    for (jid, _group) in groups {
        let confirmed = store.get_agent_cursor(&jid).await?.unwrap_or_default();
        let pending_msgs = store.get_messages_since(&jid, &confirmed, "").await?;
        if !pending_msgs.is_empty() {
            info!(
                chat_jid = jid.as_str(),
                count = pending_msgs.len(),
                "recovery: re-enqueuing unprocessed messages"
            );
            queue.enqueue_message_check(&jid).await;
        }
    }

    let _ = now_iso();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_regex_matches_at_mention() {
        let re = build_trigger_regex("Amtiskaw", None);
        assert!(re.is_match("@Amtiskaw hello"));
        assert!(re.is_match("@amtiskaw hello"));
        assert!(!re.is_match("hello @Amtiskaw"));
    }

    #[test]
    fn trigger_regex_with_custom_trigger() {
        let re = build_trigger_regex("Amtiskaw", Some("!ai"));
        assert!(re.is_match("@Amtiskaw hello"));
        assert!(re.is_match("!ai do something"));
        assert!(!re.is_match("hello !ai"));
    }

    #[test]
    fn format_messages_joins_sender_and_content() {
        let msgs = vec![
            intercom_core::store::NewMessage {
                id: "1".into(),
                chat_jid: "tg:123".into(),
                sender: "u1".into(),
                sender_name: "Alice".into(),
                content: "Hello".into(),
                timestamp: "2026-01-01T00:00:00Z".into(),
                is_from_me: false,
                is_bot_message: false,
            },
            intercom_core::store::NewMessage {
                id: "2".into(),
                chat_jid: "tg:123".into(),
                sender: "bot".into(),
                sender_name: "Assistant".into(),
                content: "Hi".into(),
                timestamp: "2026-01-01T00:01:00Z".into(),
                is_from_me: true,
                is_bot_message: true,
            },
        ];
        let result = format_messages(&msgs);
        assert_eq!(result, "[Alice]: Hello\n[Assistant]: Hi");
    }

    #[test]
    fn format_empty_messages_is_empty_string() {
        assert!(format_messages(&[]).is_empty());
    }

    #[tokio::test]
    async fn unregistered_chat_is_ignored() {
        let store = Store::open_in_memory().unwrap();
        let queue = GroupQueue::new(5, std::env::temp_dir());
        let config = MessageLoopConfig {
            assistant_name: "Assistant".to_string(),
            main_group_folder: "main".to_string(),
        };
        let msg = InboundMessage {
            chat_jid: "tg:999".to_string(),
            sender: "u1".to_string(),
            sender_name: "Alice".to_string(),
            content: "hi".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        route_inbound_message(&store, &queue, &config, &msg).await.unwrap();
        assert!(store.get_agent_cursor("tg:999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_clears_stale_pending_cursors() {
        let store = Store::open_in_memory().unwrap();
        let queue = GroupQueue::new(5, std::env::temp_dir());
        store.set_pending_cursor("tg:1", "2026-01-01T00:00:00Z").await.unwrap();

        recover_pending_cursors(&store, &queue).await.unwrap();

        assert!(store.get_pending_cursor("tg:1").await.unwrap().is_none());
    }
}
