//! Conversation id resolution and multi-round recomputation.

use chrono::{DateTime, Utc};

use crate::models::{ChatLogEntry, ConversationUpdate};

/// Conversation id for a call: the request metadata value, then the
/// `X-Conversation-ID` header, otherwise one synthesized from user and time.
///
/// Synthesized ids only group calls made by one user within the same second;
/// clients that want real multi-round tracking must send an id.
pub fn resolve_conversation_id(
    from_request: Option<&str>,
    from_header: Option<&str>,
    user_id: i64,
    now: DateTime<Utc>,
) -> String {
    from_request
        .filter(|id| !id.is_empty())
        .or(from_header.filter(|id| !id.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("conv_{}_{}", user_id, now.timestamp()))
}

/// Updates that bring a conversation's entries up to date.
///
/// With more than one entry, every entry is multi-round and the longest keeps
/// the maximum length. Returns only entries that actually change, so applying
/// the result and recomputing yields nothing.
pub fn conversation_updates(entries: &[ChatLogEntry]) -> Vec<ConversationUpdate> {
    if entries.len() <= 1 {
        return Vec::new();
    }

    let max_length = entries
        .iter()
        .map(|e| e.conversation_length)
        .max()
        .unwrap_or_default();
    let longest = entries
        .iter()
        .find(|e| e.conversation_length == max_length)
        .map(|e| e.id);

    entries
        .iter()
        .filter_map(|entry| {
            let conversation_length = if Some(entry.id) == longest {
                max_length
            } else {
                entry.conversation_length
            };
            let changed =
                !entry.is_multiround || entry.conversation_length != conversation_length;
            changed.then_some(ConversationUpdate {
                id: entry.id,
                is_multiround: true,
                conversation_length,
            })
        })
        .collect()
}
