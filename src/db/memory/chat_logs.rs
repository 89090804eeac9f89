use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::ChatLogRepo,
    },
    models::{
        ChatLogEntry, ChatLogFilter, ChatLogPage, ChatLogStats, ConversationUpdate, NamedCount,
        PageParams, STATS_TOP_N, UserCount,
    },
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: BTreeMap<i64, ChatLogEntry>,
}

/// Chat log kept in process memory, ordered by id.
#[derive(Default)]
pub struct MemoryChatLogRepo {
    inner: RwLock<Inner>,
}

impl MemoryChatLogRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect<F, K>(&self, predicate: F, sort_key: K, limit: i64) -> Vec<ChatLogEntry>
    where
        F: Fn(&ChatLogEntry) -> bool,
        K: FnMut(&ChatLogEntry, &ChatLogEntry) -> std::cmp::Ordering,
    {
        let inner = self.inner.read();
        let mut rows: Vec<ChatLogEntry> =
            inner.rows.values().filter(|e| predicate(e)).cloned().collect();
        rows.sort_by(sort_key);
        rows.truncate(limit.max(0) as usize);
        rows
    }

    fn page(&self, predicate: impl Fn(&ChatLogEntry) -> bool, page: PageParams) -> ChatLogPage {
        let inner = self.inner.read();
        let matching: Vec<&ChatLogEntry> =
            inner.rows.values().rev().filter(|e| predicate(e)).collect();
        let items = matching
            .iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .map(|e| (*e).clone())
            .collect();
        ChatLogPage {
            items,
            total: matching.len() as i64,
            page: page.page.max(1),
            page_size: page.limit(),
        }
    }
}

#[async_trait]
impl ChatLogRepo for MemoryChatLogRepo {
    async fn append(&self, mut entry: ChatLogEntry) -> DbResult<i64> {
        let mut inner = self.inner.write();
        inner.next_id += 1;
        entry.id = inner.next_id;
        inner.rows.insert(entry.id, entry);
        Ok(inner.next_id)
    }

    async fn find_by_prompt_hash(
        &self,
        user_id: i64,
        prompt_hash: &str,
    ) -> DbResult<Option<ChatLogEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .rows
            .values()
            .find(|e| e.user_id == user_id && e.prompt_hash == prompt_hash)
            .cloned())
    }

    async fn record_duplicate(&self, id: i64, seen_at: DateTime<Utc>) -> DbResult<()> {
        let mut inner = self.inner.write();
        let entry = inner.rows.get_mut(&id).ok_or(DbError::NotFound)?;
        entry.duplicate_count += 1;
        entry.last_seen_at = seen_at;
        Ok(())
    }

    async fn list_by_conversation(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> DbResult<Vec<ChatLogEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .rows
            .values()
            .filter(|e| e.conversation_id == conversation_id && e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_conversation_fields(&self, updates: &[ConversationUpdate]) -> DbResult<()> {
        let mut inner = self.inner.write();
        for update in updates {
            if let Some(entry) = inner.rows.get_mut(&update.id) {
                entry.is_multiround = update.is_multiround;
                entry.conversation_length = update.conversation_length;
            }
        }
        Ok(())
    }

    async fn list_by_user(&self, user_id: i64, page: PageParams) -> DbResult<ChatLogPage> {
        Ok(self.page(|e| e.user_id == user_id, page))
    }

    async fn list_duplicates(
        &self,
        user_id: Option<i64>,
        limit: i64,
    ) -> DbResult<Vec<ChatLogEntry>> {
        Ok(self.collect(
            |e| e.duplicate_count > 1 && user_id.is_none_or(|id| e.user_id == id),
            |a, b| {
                b.duplicate_count
                    .cmp(&a.duplicate_count)
                    .then(b.last_seen_at.cmp(&a.last_seen_at))
            },
            limit,
        ))
    }

    async fn list_longest(&self, user_id: Option<i64>, limit: i64) -> DbResult<Vec<ChatLogEntry>> {
        Ok(self.collect(
            |e| e.is_multiround && user_id.is_none_or(|id| e.user_id == id),
            |a, b| {
                b.conversation_length
                    .cmp(&a.conversation_length)
                    .then(b.id.cmp(&a.id))
            },
            limit,
        ))
    }

    async fn list(&self, filter: &ChatLogFilter, page: PageParams) -> DbResult<ChatLogPage> {
        Ok(self.page(|e| filter.matches(e), page))
    }

    async fn stats(&self, filter: &ChatLogFilter) -> DbResult<ChatLogStats> {
        let inner = self.inner.read();
        let rows: Vec<&ChatLogEntry> = inner.rows.values().filter(|e| filter.matches(e)).collect();
        if rows.is_empty() {
            return Ok(ChatLogStats::default());
        }

        let mut users = HashSet::new();
        let mut conversations = HashSet::new();
        let mut models: HashMap<&str, i64> = HashMap::new();
        let mut request_types: HashMap<&str, i64> = HashMap::new();
        let mut per_user: HashMap<i64, (&str, i64)> = HashMap::new();
        let mut stats = ChatLogStats {
            total_logs: rows.len() as i64,
            ..Default::default()
        };
        let mut length_sum = 0i64;

        for e in &rows {
            users.insert(e.user_id);
            if !e.conversation_id.is_empty() {
                conversations.insert(e.conversation_id.as_str());
            }
            *models.entry(e.model_name.as_str()).or_default() += 1;
            *request_types.entry(e.request_type.as_str()).or_default() += 1;
            per_user.entry(e.user_id).or_insert((e.username.as_str(), 0)).1 += 1;

            stats.total_prompt_tokens += e.prompt_tokens;
            stats.total_completion_tokens += e.completion_tokens;
            stats.total_quota += e.quota;
            if e.duplicate_count > 1 {
                stats.duplicate_entries += 1;
            }
            if e.is_multiround {
                stats.multiround_entries += 1;
            }
            length_sum += e.conversation_length;
        }

        stats.unique_users = users.len() as i64;
        stats.unique_conversations = conversations.len() as i64;
        stats.avg_conversation_length = length_sum as f64 / rows.len() as f64;
        stats.top_models = ranked(models, Some(STATS_TOP_N));
        stats.request_types = ranked(request_types, None);

        let mut top_users: Vec<UserCount> = per_user
            .into_iter()
            .map(|(user_id, (username, count))| UserCount {
                user_id,
                username: username.to_string(),
                count,
            })
            .collect();
        top_users.sort_by(|a, b| b.count.cmp(&a.count).then(a.user_id.cmp(&b.user_id)));
        top_users.truncate(STATS_TOP_N as usize);
        stats.top_users = top_users;

        Ok(stats)
    }

    async fn delete(&self, filter: &ChatLogFilter) -> DbResult<u64> {
        if filter.is_empty() {
            return Err(DbError::Validation(
                "at least one filter condition is required".into(),
            ));
        }
        let mut inner = self.inner.write();
        let before = inner.rows.len();
        inner.rows.retain(|_, e| !filter.matches(e));
        Ok((before - inner.rows.len()) as u64)
    }

    async fn export(
        &self,
        filter: &ChatLogFilter,
        max_records: i64,
    ) -> DbResult<Vec<ChatLogEntry>> {
        Ok(self.collect(|e| filter.matches(e), |a, b| b.id.cmp(&a.id), max_records))
    }
}

fn ranked(counts: HashMap<&str, i64>, limit: Option<i64>) -> Vec<NamedCount> {
    let mut ranked: Vec<NamedCount> = counts
        .into_iter()
        .map(|(name, count)| NamedCount {
            name: name.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    if let Some(limit) = limit {
        ranked.truncate(limit as usize);
    }
    ranked
}
