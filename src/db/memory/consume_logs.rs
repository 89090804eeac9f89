use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    db::{error::DbResult, repos::ConsumeLogRepo},
    models::ConsumeLogEntry,
};

#[derive(Default)]
struct Inner {
    request_ids: HashSet<String>,
    rows: Vec<ConsumeLogEntry>,
}

#[derive(Default)]
pub struct MemoryConsumeLogRepo {
    inner: RwLock<Inner>,
}

impl MemoryConsumeLogRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsumeLogRepo for MemoryConsumeLogRepo {
    async fn log_batch(&self, entries: Vec<ConsumeLogEntry>) -> DbResult<usize> {
        let mut inner = self.inner.write();
        let mut inserted = 0;
        for entry in entries {
            if inner.request_ids.insert(entry.request_id.clone()) {
                inner.rows.push(entry);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_by_user(&self, user_id: i64, limit: i64) -> DbResult<Vec<ConsumeLogEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .rows
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
