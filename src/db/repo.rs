use super::model::{ObjectCount, ObjectLink, StoredNotice};
use crate::model::{
    ApiHealth, FetchJob, FetchStatus, FetchTarget, HailObject, NoticeLevel, ObjectType, TokenState,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .connect(&format!("{normalized}{}", create_flag(&normalized)))
        .await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
pub async fn memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

fn create_flag(url: &str) -> &'static str {
    if url.starts_with("sqlite::memory") || url.contains("mode=") {
        ""
    } else if url.contains('?') {
        "&mode=rwc"
    } else {
        "?mode=rwc"
    }
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Token state (single `hail_config` row)
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn load_token_state(pool: &Pool) -> Result<TokenState> {
    let row = sqlx::query(
        "SELECT version, access_token, access_token_expiry, refresh_token, user_id, \
                organisations, api_status, api_status_message \
         FROM hail_config WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(TokenState::default());
    };

    let organisations: String = row.get("organisations");
    let organisations: Vec<String> = serde_json::from_str(&organisations)
        .context("hail_config.organisations is not a JSON list")?;
    let api_status: String = row.get("api_status");

    Ok(TokenState {
        version: row.get("version"),
        access_token: non_empty(row.get("access_token")),
        access_token_expiry: row.get("access_token_expiry"),
        refresh_token: non_empty(row.get("refresh_token")),
        user_id: non_empty(row.get("user_id")),
        organisations,
        api_health: ApiHealth::from_parts(&api_status, row.get("api_status_message")),
    })
}

/// Persist `state` if the stored row still has version `state.version - 1`.
/// Returns `false` when another writer got there first.
#[instrument(skip_all, fields(version = state.version))]
pub async fn save_token_state(pool: &Pool, state: &TokenState) -> Result<bool> {
    let organisations = serde_json::to_string(&state.organisations)?;
    let res = sqlx::query(
        "UPDATE hail_config SET version = ?, access_token = ?, access_token_expiry = ?, \
                refresh_token = ?, user_id = ?, organisations = ?, api_status = ?, \
                api_status_message = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = 1 AND version = ?",
    )
    .bind(state.version)
    .bind(state.access_token.as_deref())
    .bind(state.access_token_expiry)
    .bind(state.refresh_token.as_deref())
    .bind(state.user_id.as_deref())
    .bind(organisations)
    .bind(state.api_health.as_str())
    .bind(state.api_health.message())
    .bind(state.version - 1)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Fetch job queue
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn enqueue_fetch_job(pool: &Pool, target: &FetchTarget) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO fetch_jobs (to_fetch, status, global_total, global_done, created_at, updated_at) \
         VALUES (?, ?, 0, 0, ?, ?) RETURNING id",
    )
    .bind(target.encode())
    .bind(FetchStatus::Starting.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

const JOB_COLUMNS: &str =
    "id, to_fetch, status, global_total, global_done, error, created_at, updated_at";

fn job_from_row(row: &SqliteRow) -> Result<FetchJob> {
    let id: i64 = row.get("id");
    let status: String = row.get("status");
    let status = FetchStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("fetch job {} has unknown status {}", id, status))?;
    Ok(FetchJob {
        id,
        to_fetch: row.get("to_fetch"),
        status,
        global_total: row.get("global_total"),
        global_done: row.get("global_done"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn get_fetch_job(pool: &Pool, id: i64) -> Result<Option<FetchJob>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM fetch_jobs WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// All jobs waiting to start, oldest first.
#[instrument(skip_all)]
pub async fn starting_fetch_jobs(pool: &Pool) -> Result<Vec<FetchJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM fetch_jobs WHERE status = ? ORDER BY created_at ASC, id ASC"
    ))
    .bind(FetchStatus::Starting.as_str())
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

pub async fn recent_fetch_jobs(pool: &Pool, limit: i64) -> Result<Vec<FetchJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM fetch_jobs ORDER BY created_at DESC, id DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Move a job from Starting to Running. Returns `false` if it was no longer
/// Starting, i.e. another worker owns it.
#[instrument(skip_all, fields(job_id = id))]
pub async fn claim_fetch_job(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE fetch_jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(FetchStatus::Running.as_str())
    .bind(Utc::now())
    .bind(id)
    .bind(FetchStatus::Starting.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all, fields(job_id = id))]
pub async fn set_fetch_job_total(pool: &Pool, id: i64, total: i64) -> Result<()> {
    sqlx::query("UPDATE fetch_jobs SET global_total = ?, updated_at = ? WHERE id = ?")
        .bind(total)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to persist fetch job total")?;
    Ok(())
}

/// Bump `global_done` by one and return the new value.
#[instrument(skip_all, fields(job_id = id))]
pub async fn increment_fetch_job_done(pool: &Pool, id: i64) -> Result<i64> {
    let done: i64 = sqlx::query_scalar(
        "UPDATE fetch_jobs SET global_done = global_done + 1, updated_at = ? WHERE id = ? \
         RETURNING global_done",
    )
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| anyhow!("fetch job {} not found", id))?;
    Ok(done)
}

#[instrument(skip_all, fields(job_id = id, status = status.as_str()))]
pub async fn finish_fetch_job(
    pool: &Pool,
    id: i64,
    status: FetchStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE fetch_jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to persist fetch job status")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Local copies of remote objects
// ---------------------------------------------------------------------------

/// Insert or update the record keyed by `(object_type, hail_id)`.
#[instrument(skip_all, fields(object_type = %object.object_type, hail_id = %object.hail_id))]
pub async fn upsert_object(pool: &Pool, object: &HailObject) -> Result<i64> {
    let payload = serde_json::to_string(&object.payload)?;
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO hail_objects (object_type, hail_id, org_id, name, payload, fetched_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (object_type, hail_id) DO UPDATE SET \
            org_id = excluded.org_id, name = excluded.name, \
            payload = excluded.payload, fetched_at = excluded.fetched_at \
         RETURNING id",
    )
    .bind(object.object_type.as_str())
    .bind(&object.hail_id)
    .bind(&object.org_id)
    .bind(object.name.as_deref())
    .bind(payload)
    .bind(object.fetched_at)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn object_fetched_at(
    pool: &Pool,
    object_type: ObjectType,
    hail_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let at = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT fetched_at FROM hail_objects WHERE object_type = ? AND hail_id = ?",
    )
    .bind(object_type.as_str())
    .bind(hail_id)
    .fetch_optional(pool)
    .await?;
    Ok(at)
}

pub async fn get_object(
    pool: &Pool,
    object_type: ObjectType,
    hail_id: &str,
) -> Result<Option<HailObject>> {
    let row = sqlx::query(
        "SELECT org_id, name, payload, fetched_at FROM hail_objects \
         WHERE object_type = ? AND hail_id = ?",
    )
    .bind(object_type.as_str())
    .bind(hail_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let payload: String = row.get("payload");
    Ok(Some(HailObject {
        object_type,
        hail_id: hail_id.to_string(),
        org_id: row.get("org_id"),
        name: row.get("name"),
        payload: serde_json::from_str(&payload).context("stored payload is not JSON")?,
        fetched_at: row.get("fetched_at"),
    }))
}

pub async fn count_objects(pool: &Pool, object_type: ObjectType) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM hail_objects WHERE object_type = ?")
            .bind(object_type.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn object_counts(pool: &Pool) -> Result<Vec<ObjectCount>> {
    let rows = sqlx::query(
        "SELECT object_type, COUNT(*) AS cnt FROM hail_objects GROUP BY object_type ORDER BY object_type",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| ObjectCount {
            object_type: row.get("object_type"),
            count: row.get("cnt"),
        })
        .collect())
}

/// Replace every stored link of the given object in one transaction.
#[instrument(skip_all, fields(object_type = %object_type, hail_id = %hail_id))]
pub async fn replace_object_links(
    pool: &Pool,
    object_type: ObjectType,
    hail_id: &str,
    links: &[ObjectLink],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM hail_object_links WHERE object_type = ? AND hail_id = ?")
        .bind(object_type.as_str())
        .bind(hail_id)
        .execute(&mut *tx)
        .await?;
    for link in links {
        sqlx::query(
            "INSERT OR IGNORE INTO hail_object_links (object_type, hail_id, linked_type, linked_hail_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(object_type.as_str())
        .bind(hail_id)
        .bind(link.linked_type.as_str())
        .bind(&link.linked_hail_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn object_links(
    pool: &Pool,
    object_type: ObjectType,
    hail_id: &str,
) -> Result<Vec<ObjectLink>> {
    let rows = sqlx::query(
        "SELECT linked_type, linked_hail_id FROM hail_object_links \
         WHERE object_type = ? AND hail_id = ? ORDER BY linked_type, linked_hail_id",
    )
    .bind(object_type.as_str())
    .bind(hail_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            let linked_type: String = row.get("linked_type");
            let linked_type = ObjectType::parse_type(&linked_type)
                .ok_or_else(|| anyhow!("unknown linked type {}", linked_type))?;
            Ok(ObjectLink {
                linked_type,
                linked_hail_id: row.get("linked_hail_id"),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Notices
// ---------------------------------------------------------------------------

pub async fn insert_notice(pool: &Pool, level: NoticeLevel, message: &str) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO notices (level, message) VALUES (?, ?) RETURNING id")
        .bind(level.as_str())
        .bind(message)
        .fetch_one(pool)
        .await?;
    Ok(rec.get("id"))
}

pub async fn recent_notices(pool: &Pool, limit: i64) -> Result<Vec<StoredNotice>> {
    let rows = sqlx::query(
        "SELECT id, level, message, created_at FROM notices ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| StoredNotice {
            id: row.get("id"),
            level: row.get("level"),
            message: row.get("message"),
            created_at: row.get("created_at"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn token_state_compare_and_swap() {
        let pool = memory_pool().await.unwrap();
        let s0 = load_token_state(&pool).await.unwrap();
        assert_eq!(s0.version, 0);
        assert!(s0.organisations.is_empty());

        let s1 = s0.with_tokens("acc".into(), "ref".into(), 3600, Utc::now());
        assert!(save_token_state(&pool, &s1).await.unwrap());

        // A second writer derived from the same base loses.
        let stale = s0.with_organisations(vec!["org".into()]);
        assert!(!save_token_state(&pool, &stale).await.unwrap());

        let loaded = load_token_state(&pool).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.access_token.as_deref(), Some("acc"));
        assert!(loaded.organisations.is_empty());

        let s2 = loaded.with_health(ApiHealth::Error("boom".into()));
        assert!(save_token_state(&pool, &s2).await.unwrap());
        let loaded = load_token_state(&pool).await.unwrap();
        assert_eq!(loaded.api_health, ApiHealth::Error("boom".into()));
    }

    #[tokio::test]
    async fn jobs_claim_once_and_track_progress() {
        let pool = memory_pool().await.unwrap();
        let first = enqueue_fetch_job(&pool, &FetchTarget::All).await.unwrap();
        let second = enqueue_fetch_job(&pool, &FetchTarget::Type(ObjectType::Image))
            .await
            .unwrap();

        let pending = starting_fetch_jobs(&pool).await.unwrap();
        assert_eq!(
            pending.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![first, second]
        );

        assert!(claim_fetch_job(&pool, first).await.unwrap());
        assert!(!claim_fetch_job(&pool, first).await.unwrap());

        set_fetch_job_total(&pool, first, 2).await.unwrap();
        assert_eq!(increment_fetch_job_done(&pool, first).await.unwrap(), 1);
        assert_eq!(increment_fetch_job_done(&pool, first).await.unwrap(), 2);
        finish_fetch_job(&pool, first, FetchStatus::Done, None)
            .await
            .unwrap();

        let job = get_fetch_job(&pool, first).await.unwrap().unwrap();
        assert_eq!(job.status, FetchStatus::Done);
        assert_eq!((job.global_total, job.global_done), (2, 2));
        assert_eq!(job.target(), FetchTarget::All);

        let pending = starting_fetch_jobs(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_type_and_hail_id() {
        let pool = memory_pool().await.unwrap();
        let mut obj = HailObject {
            object_type: ObjectType::Article,
            hail_id: "A1".into(),
            org_id: "O1".into(),
            name: Some("first".into()),
            payload: json!({"id": "A1", "title": "first"}),
            fetched_at: Utc::now(),
        };
        let id1 = upsert_object(&pool, &obj).await.unwrap();
        obj.name = Some("second".into());
        obj.payload = json!({"id": "A1", "title": "second"});
        let id2 = upsert_object(&pool, &obj).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(count_objects(&pool, ObjectType::Article).await.unwrap(), 1);

        // Same remote id under another type is a different record.
        obj.object_type = ObjectType::Image;
        upsert_object(&pool, &obj).await.unwrap();
        assert_eq!(count_objects(&pool, ObjectType::Image).await.unwrap(), 1);

        let stored = get_object(&pool, ObjectType::Article, "A1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name.as_deref(), Some("second"));
        assert_eq!(stored.payload["title"], "second");
    }

    #[tokio::test]
    async fn links_are_replaced() {
        let pool = memory_pool().await.unwrap();
        let tag = |id: &str| ObjectLink {
            linked_type: ObjectType::PublicTag,
            linked_hail_id: id.into(),
        };
        replace_object_links(&pool, ObjectType::Article, "A1", &[tag("t1"), tag("t2")])
            .await
            .unwrap();
        replace_object_links(&pool, ObjectType::Article, "A1", &[tag("t3")])
            .await
            .unwrap();
        let links = object_links(&pool, ObjectType::Article, "A1").await.unwrap();
        assert_eq!(links, vec![tag("t3")]);
    }

    #[tokio::test]
    async fn notices_are_listed_newest_first() {
        let pool = memory_pool().await.unwrap();
        insert_notice(&pool, NoticeLevel::Info, "one").await.unwrap();
        insert_notice(&pool, NoticeLevel::Error, "two").await.unwrap();
        let notices = recent_notices(&pool, 10).await.unwrap();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].message, "two");
        assert!(notices[0].is_error());
    }

    #[test]
    fn prepare_sqlite_url_keeps_memory() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("sqlite:/tmp/hail.db?cache=shared"),
            "sqlite:///tmp/hail.db?cache=shared"
        );
    }
}
