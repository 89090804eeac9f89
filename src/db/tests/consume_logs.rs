//! Shared tests for ConsumeLogRepo implementations

use chrono::Utc;

use crate::{db::repos::ConsumeLogRepo, models::ConsumeLogEntry};

fn entry(user_id: i64, request_id: &str, quota: i64) -> ConsumeLogEntry {
    ConsumeLogEntry {
        user_id,
        token_id: 1,
        channel_id: 1,
        model_name: "gpt-4o-mini".into(),
        prompt_tokens: 100,
        completion_tokens: 20,
        quota,
        use_time_seconds: 2,
        is_stream: true,
        content: "tokens 0.0012 => 600".into(),
        request_id: request_id.into(),
        created_at: Utc::now(),
    }
}

pub async fn test_log_batch_skips_duplicate_request_ids(repo: &dyn ConsumeLogRepo) {
    let inserted = repo
        .log_batch(vec![entry(1, "req-1", 600), entry(1, "req-2", 10)])
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let inserted = repo
        .log_batch(vec![entry(1, "req-2", 10), entry(1, "req-3", 5)])
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    assert_eq!(repo.log_batch(Vec::new()).await.unwrap(), 0);
}

pub async fn test_list_by_user_newest_first(repo: &dyn ConsumeLogRepo) {
    repo.log_batch(vec![
        entry(1, "a", 1),
        entry(2, "b", 2),
        entry(1, "c", 3),
    ])
    .await
    .unwrap();

    let rows = repo.list_by_user(1, 10).await.unwrap();
    assert_eq!(
        rows.iter().map(|r| r.request_id.as_str()).collect::<Vec<_>>(),
        vec!["c", "a"]
    );
    assert!(rows[0].is_stream);
    assert_eq!(repo.list_by_user(1, 1).await.unwrap().len(), 1);
}

mod memory_tests {
    use crate::db::memory::MemoryConsumeLogRepo;

    macro_rules! memory_test {
        ($name:ident) => {
            #[tokio::test]
            async fn $name() {
                let repo = MemoryConsumeLogRepo::new();
                super::$name(&repo).await;
            }
        };
    }

    memory_test!(test_log_batch_skips_duplicate_request_ids);
    memory_test!(test_list_by_user_newest_first);
}

#[cfg(feature = "database-sqlite")]
mod sqlite_tests {
    use crate::db::{
        sqlite::SqliteConsumeLogRepo,
        tests::harness::{create_sqlite_pool, run_sqlite_migrations},
    };

    async fn create_repo() -> SqliteConsumeLogRepo {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        SqliteConsumeLogRepo::new(pool)
    }

    macro_rules! sqlite_test {
        ($name:ident) => {
            #[tokio::test]
            async fn $name() {
                let repo = create_repo().await;
                super::$name(&repo).await;
            }
        };
    }

    sqlite_test!(test_log_batch_skips_duplicate_request_ids);
    sqlite_test!(test_list_by_user_newest_first);
}
