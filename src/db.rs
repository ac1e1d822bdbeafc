use crate::error::StoreError;
use crate::models::{
    Address, Disposition, EmailPart, EmailTask, Header, NewTask, Recipients, TaskId, TaskStatus,
    TaskUpdate,
};
use crate::store::{Candidate, QueueStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{error, info, warn};

const TASK_COLUMNS: &str = "id, status, priority, created_at, sent_at, retry_count, authors, \
     recipients, reply_to, subject, encoding, context, context_identifier, last_error";

/// sqlite-backed queue.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url {database_url}"))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to open database")?;
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied. Every query shares
    /// one connection, otherwise each would see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema)
            .execute(&self.pool)
            .await
            .context("Failed to apply schema")?;
        self.ensure_email_columns().await
    }

    /// Adds columns that databases created by older releases lack.
    async fn ensure_email_columns(&self) -> Result<()> {
        let columns: Vec<String> = sqlx::query("PRAGMA table_info(email)")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read email columns")?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<std::result::Result<_, _>>()
            .context("Failed to read email columns")?;

        if !columns.iter().any(|c| c == "locked_until") {
            sqlx::query("ALTER TABLE email ADD COLUMN locked_until INTEGER")
                .execute(&self.pool)
                .await
                .context("Failed to add email.locked_until")?;
            info!("Added locked_until column to email table");
        }
        Ok(())
    }

    /// Newest task whose subject or author list contains `term`.
    pub async fn search(&self, term: &str) -> Result<Option<EmailTask>, StoreError> {
        let pattern = format!("%{term}%");
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM email
             WHERE subject LIKE ? OR authors LIKE ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(&pattern)
        .bind(&pattern)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }
}

#[async_trait]
impl QueueStore for Database {
    async fn insert_task(&self, task: &NewTask, parts: &[EmailPart]) -> Result<TaskId, StoreError> {
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            "INSERT INTO email (status, priority, created_at, retry_count, authors, recipients,
                                reply_to, subject, encoding, context, context_identifier)
             VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(TaskStatus::Waiting.as_str())
        .bind(task.priority)
        .bind(task.created_at.timestamp())
        .bind(serde_json::to_string(&task.authors)?)
        .bind(serde_json::to_string(&task.recipients)?)
        .bind(task.reply_to.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&task.subject)
        .bind(&task.encoding)
        .bind(&task.context)
        .bind(task.context_identifier)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for part in parts {
            sqlx::query(
                "INSERT INTO email_part (email_id, mime_type, encoding, charset, disposition,
                                         filename, content_id, contents)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&part.mime_type)
            .bind(&part.encoding)
            .bind(&part.charset)
            .bind(part.disposition.map(|d| d.as_str()))
            .bind(&part.filename)
            .bind(&part.content_id)
            .bind(&part.contents)
            .execute(&mut *tx)
            .await?;
        }

        for header in &task.headers {
            sqlx::query("INSERT INTO email_header (email_id, name, value) VALUES (?, ?, ?)")
                .bind(id)
                .bind(&header.name)
                .bind(&header.value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn select_dispatchable(
        &self,
        max_retries: u32,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM email
             WHERE status IN ('waiting', 'error')
               AND retry_count >= 0 AND retry_count < ?
               AND (locked_until IS NULL OR locked_until <= ?)
             ORDER BY priority ASC, id ASC
             LIMIT ?"
        ))
        .bind(i64::from(max_retries))
        .bind(now.timestamp())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        // rows are decoded one by one so a damaged row only affects itself
        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: TaskId = row.try_get("id")?;
            match task_from_row(row) {
                Ok(task) => candidates.push(Candidate::Task(task)),
                Err(e) => match row
                    .try_get::<i64, _>("retry_count")
                    .ok()
                    .and_then(|n| u32::try_from(n).ok())
                {
                    Some(retry_count) => {
                        warn!(task_id = id, error = %e, "Selected an unreadable task row");
                        candidates.push(Candidate::Unreadable {
                            id,
                            retry_count,
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        error!(task_id = id, error = %e, "Skipping task row without a usable retry count");
                    }
                },
            }
        }
        Ok(candidates)
    }

    async fn claim_task(
        &self,
        id: TaskId,
        retry_count: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE email SET locked_until = ?
             WHERE id = ? AND status IN ('waiting', 'error') AND retry_count = ?
               AND (locked_until IS NULL OR locked_until <= ?)",
        )
        .bind(lease_until.timestamp())
        .bind(id)
        .bind(i64::from(retry_count))
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<EmailTask>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM email WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn load_parts(&self, id: TaskId) -> Result<Vec<EmailPart>, StoreError> {
        let rows = sqlx::query(
            "SELECT mime_type, encoding, charset, disposition, filename, content_id, contents
             FROM email_part
             WHERE email_id = ?
             ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<EmailPart, StoreError> {
                let disposition = row
                    .try_get::<Option<String>, _>(3)?
                    .map(|d| {
                        Disposition::parse(&d).ok_or_else(|| StoreError::Corrupted {
                            task_id: id,
                            column: "disposition",
                            reason: format!("unknown disposition {d:?}"),
                        })
                    })
                    .transpose()?;
                Ok(EmailPart {
                    mime_type: row.try_get(0)?,
                    encoding: row.try_get(1)?,
                    charset: row.try_get(2)?,
                    disposition,
                    filename: row.try_get(4)?,
                    content_id: row.try_get(5)?,
                    contents: row.try_get(6)?,
                })
            })
            .collect()
    }

    async fn load_headers(&self, id: TaskId) -> Result<Vec<Header>, StoreError> {
        let rows = sqlx::query("SELECT name, value FROM email_header WHERE email_id = ? ORDER BY id ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<Header, StoreError> {
                Ok(Header {
                    name: row.try_get(0)?,
                    value: row.try_get(1)?,
                })
            })
            .collect()
    }

    async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE email
             SET status = ?, retry_count = ?, sent_at = ?, last_error = ?, locked_until = NULL
             WHERE id = ?",
        )
        .bind(update.status.as_str())
        .bind(i64::from(update.retry_count))
        .bind(update.sent_at.map(|t| t.timestamp()))
        .bind(&update.last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn select_purgeable(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM email
             WHERE status != 'waiting' AND sent_at IS NOT NULL AND sent_at < ?
             ORDER BY priority ASC, id ASC
             LIMIT ?",
        )
        .bind(cutoff.timestamp())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get(0).map_err(StoreError::from))
            .collect()
    }

    async fn delete_tasks(&self, ids: &[TaskId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for table in ["email_header", "email_part"] {
            id_list(&format!("DELETE FROM {table} WHERE email_id"), ids)
                .build()
                .execute(&mut *tx)
                .await?;
        }
        let deleted = id_list("DELETE FROM email WHERE id", ids)
            .build()
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(deleted as usize)
    }

    async fn find_by_context(
        &self,
        context: &str,
        identifier: Option<i64>,
    ) -> Result<Vec<EmailTask>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM email
             WHERE context = ? AND (? IS NULL OR context_identifier = ?)
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(context)
        .bind(identifier)
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// `{prefix} IN (?, ?, ...)` with one bind per id.
fn id_list(prefix: &str, ids: &[TaskId]) -> QueryBuilder<'static, Sqlite> {
    let mut query = QueryBuilder::new(prefix);
    query.push(" IN (");
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    query
}

fn task_from_row(row: &SqliteRow) -> Result<EmailTask, StoreError> {
    let id: TaskId = row.try_get("id")?;
    let corrupted = |column: &'static str, reason: String| StoreError::Corrupted {
        task_id: id,
        column,
        reason,
    };

    let status: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| corrupted("status", format!("unknown status {status:?}")))?;

    let retry_count: i64 = row.try_get("retry_count")?;
    let retry_count = u32::try_from(retry_count)
        .map_err(|_| corrupted("retry_count", format!("out of range: {retry_count}")))?;

    let timestamp = |column: &'static str, secs: i64| {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| corrupted(column, format!("out of range: {secs}")))
    };
    let created_at = timestamp("created_at", row.try_get("created_at")?)?;
    let sent_at = row
        .try_get::<Option<i64>, _>("sent_at")?
        .map(|secs| timestamp("sent_at", secs))
        .transpose()?;

    let authors: Vec<Address> = json_column(row, id, "authors")?;
    let recipients: Recipients = json_column(row, id, "recipients")?;
    let reply_to: Option<Address> = match row.try_get::<Option<String>, _>("reply_to")? {
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|e| corrupted("reply_to", e.to_string()))?,
        ),
        None => None,
    };

    Ok(EmailTask {
        id,
        status,
        priority: row.try_get("priority")?,
        created_at,
        sent_at,
        retry_count,
        authors,
        recipients,
        reply_to,
        subject: row.try_get("subject")?,
        encoding: row.try_get("encoding")?,
        context: row.try_get("context")?,
        context_identifier: row.try_get("context_identifier")?,
        last_error: row.try_get("last_error")?,
    })
}

fn json_column<T: DeserializeOwned>(
    row: &SqliteRow,
    task_id: TaskId,
    column: &'static str,
) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupted {
        task_id,
        column,
        reason: e.to_string(),
    })
}
