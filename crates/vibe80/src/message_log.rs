//! Per-worktree append-only message store. The single source of truth
//! for history — streaming deltas are ephemeral and never land here.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::model::Message;
use crate::storage::Storage;

fn messages_key(session_id: &str, worktree_id: &str) -> String {
    format!("msglog:{session_id}:{worktree_id}:messages")
}

fn index_key(session_id: &str, worktree_id: &str) -> String {
    format!("msglog:{session_id}:{worktree_id}:index")
}

pub struct MessageLog {
    storage: Arc<dyn Storage>,
}

impl MessageLog {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Assigns a monotonically increasing `seq`, updates the
    /// `messageId -> seq` index, and appends. Re-appending an id already
    /// in the index is a no-op (idempotent).
    pub async fn append(&self, session_id: &str, worktree_id: &str, mut message: Message) -> Result<Message> {
        let index_key = index_key(session_id, worktree_id);
        if let Some(existing_seq) = self.storage.hget(&index_key, &message.id).await? {
            debug!(message_id = %message.id, "duplicate append, ignoring");
            message.seq = existing_seq
                .as_u64()
                .ok_or_else(|| EngineError::Storage("corrupt seq index".into()))?;
            return Ok(message);
        }

        let messages_key = messages_key(session_id, worktree_id);
        let current_len = self.storage.list_range(&messages_key, 0, None).await?.len();
        let seq = current_len as u64 + 1;
        message.seq = seq;

        self.storage
            .hset(&index_key, &message.id, json!(seq))
            .await?;
        self.storage
            .list_push(&messages_key, serde_json::to_value(&message).map_err(|e| {
                EngineError::Storage(format!("failed to serialize message: {e}"))
            })?)
            .await?;

        Ok(message)
    }

    /// `beforeMessageId` present and indexed -> messages newer than it;
    /// absent from the index -> empty. `limit` then trims to the last
    /// `limit` items of that range, oldest-first.
    pub async fn read(
        &self,
        session_id: &str,
        worktree_id: &str,
        limit: Option<usize>,
        before_message_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        let messages_key = messages_key(session_id, worktree_id);
        let all = self.storage.list_range(&messages_key, 0, None).await?;
        let messages = Self::deserialize_all(all)?;

        let range: Vec<Message> = if let Some(before_id) = before_message_id {
            let index_key = index_key(session_id, worktree_id);
            let Some(indexed_seq) = self.storage.hget(&index_key, before_id).await? else {
                return Ok(Vec::new());
            };
            let indexed_seq = indexed_seq
                .as_u64()
                .ok_or_else(|| EngineError::Storage("corrupt seq index".into()))?;
            messages.into_iter().filter(|m| m.seq > indexed_seq).collect()
        } else {
            messages
        };

        Ok(match limit {
            // When reading from a cursor (`beforeMessageId` given), `limit`
            // bounds how far forward the page extends: the next `limit`
            // messages after the cursor, oldest first (see DESIGN.md for
            // why this takes the *first* `limit` of the range rather than
            // the most recent ones).
            Some(limit) if before_message_id.is_some() => {
                range.into_iter().take(limit).collect()
            }
            // With no cursor, `limit` means "the most recent N messages".
            Some(limit) if range.len() > limit => range[range.len() - limit..].to_vec(),
            _ => range,
        })
    }

    pub async fn clear(&self, session_id: &str, worktree_id: &str) -> Result<()> {
        self.storage.list_clear(&messages_key(session_id, worktree_id)).await?;
        self.storage.delete(&index_key(session_id, worktree_id)).await?;
        Ok(())
    }

    fn deserialize_all(values: Vec<serde_json::Value>) -> Result<Vec<Message>> {
        values
            .into_iter()
            .map(|v| {
                serde_json::from_value(v)
                    .map_err(|e| EngineError::Storage(format!("corrupt message record: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageRole;
    use crate::storage::DashMapStorage;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn msg(id: &str, text: &str) -> Message {
        Message {
            id: id.to_string(),
            seq: 0,
            role: MessageRole::User,
            text: text.to_string(),
            attachments: vec![],
            created_at: Utc::now(),
            group_kind: None,
            command_execution: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing() {
        let log = MessageLog::new(Arc::new(DashMapStorage::new()));
        let m1 = log.append("s1", "main", msg("m1", "hi")).await.unwrap();
        let m2 = log.append("s1", "main", msg("m2", "there")).await.unwrap();
        assert_eq!(m1.seq, 1);
        assert_eq!(m2.seq, 2);
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let log = MessageLog::new(Arc::new(DashMapStorage::new()));
        log.append("s1", "main", msg("m1", "hi")).await.unwrap();
        log.append("s1", "main", msg("m1", "hi")).await.unwrap();
        let all = log.read("s1", "main", None, None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn before_message_id_returns_strictly_newer() {
        let log = MessageLog::new(Arc::new(DashMapStorage::new()));
        log.append("s1", "main", msg("m1", "a")).await.unwrap();
        log.append("s1", "main", msg("m2", "b")).await.unwrap();
        log.append("s1", "main", msg("m3", "c")).await.unwrap();

        let after_m1 = log.read("s1", "main", None, Some("m1")).await.unwrap();
        assert_eq!(
            after_m1.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m2", "m3"]
        );

        // round-trip: read({beforeMessageId: last appended}) is empty
        let after_last = log.read("s1", "main", None, Some("m3")).await.unwrap();
        assert!(after_last.is_empty());
    }

    #[tokio::test]
    async fn unknown_before_message_id_is_empty() {
        let log = MessageLog::new(Arc::new(DashMapStorage::new()));
        log.append("s1", "main", msg("m1", "a")).await.unwrap();
        let result = log.read("s1", "main", None, Some("nope")).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn pagination_returns_window_oldest_first() {
        let log = MessageLog::new(Arc::new(DashMapStorage::new()));
        for i in 1..=10 {
            log.append("s1", "main", msg(&format!("m{i}"), "x")).await.unwrap();
        }
        // beforeMessageId=m3, limit=4 -> m4..m7
        let page = log.read("s1", "main", Some(4), Some("m3")).await.unwrap();
        assert_eq!(
            page.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m4", "m5", "m6", "m7"]
        );
    }

    #[tokio::test]
    async fn clear_drops_messages_and_index() {
        let log = MessageLog::new(Arc::new(DashMapStorage::new()));
        log.append("s1", "main", msg("m1", "a")).await.unwrap();
        log.clear("s1", "main").await.unwrap();
        let all = log.read("s1", "main", None, None).await.unwrap();
        assert!(all.is_empty());
        // re-appending the same id after clear gets a fresh seq starting at 1
        let m = log.append("s1", "main", msg("m1", "a")).await.unwrap();
        assert_eq!(m.seq, 1);
    }
}
