//! Error/notice sink: human-readable messages for operators plus a log line.
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::db::{self, Pool};
use crate::model::NoticeLevel;

#[async_trait]
pub trait NoticeSink: Send + Sync {
    async fn notify(&self, level: NoticeLevel, message: &str);

    async fn error(&self, message: &str) {
        self.notify(NoticeLevel::Error, message).await
    }
}

fn log_notice(level: NoticeLevel, message: &str) {
    match level {
        NoticeLevel::Info => info!(notice = message, "hail notice"),
        NoticeLevel::Warning => warn!(notice = message, "hail notice"),
        NoticeLevel::Error => error!(notice = message, "hail notice"),
    }
}

/// Sink that only writes to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NoticeSink for LogSink {
    async fn notify(&self, level: NoticeLevel, message: &str) {
        log_notice(level, message);
    }
}

/// Sink that logs and keeps the notice in the `notices` table for display.
#[derive(Debug, Clone)]
pub struct DbNoticeSink {
    pool: Pool,
}

impl DbNoticeSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NoticeSink for DbNoticeSink {
    async fn notify(&self, level: NoticeLevel, message: &str) {
        log_notice(level, message);
        if let Err(err) = db::insert_notice(&self.pool, level, message).await {
            warn!(?err, "failed to store notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn db_sink_stores_notices() {
        let pool = db::memory_pool().await.unwrap();
        let sink = DbNoticeSink::new(pool.clone());
        sink.error("token refresh failed").await;
        sink.notify(NoticeLevel::Info, "authorised").await;

        let notices = db::recent_notices(&pool, 5).await.unwrap();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[1].message, "token refresh failed");
        assert!(notices[1].is_error());
        assert!(!notices[0].is_error());
    }
}
