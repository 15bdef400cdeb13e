//! Task Store
//!
//! Persistent, shared queue of playback requests backed by the `tasks` table.
//!
//! **Atomicity:** every status change is a single guarded `UPDATE` that matches
//! the expected prior status. Claiming is one `UPDATE ... RETURNING` statement,
//! so two workers (or two slots of one worker) can never receive the same task.
//! Nothing in this module reads a status and then writes it in a separate step.

use crate::db::init::init_database;
use crate::db::models::{DestinationId, NewTask, Task, TaskId, TaskStatus};
use crate::{time, Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TASK_COLUMNS: &str =
    "id, destination, query, requester, invite, status, title, error_detail, created_at";

/// Detail written alongside a status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusDetail {
    /// Resolved media title (normally with `playing`)
    Title(String),
    /// Diagnostic for `failed` / `error`
    Error(String),
}

impl StatusDetail {
    pub fn error(message: impl Into<String>) -> Self {
        StatusDetail::Error(message.into())
    }

    fn title_value(detail: Option<&StatusDetail>) -> Option<&str> {
        match detail {
            Some(StatusDetail::Title(title)) => Some(title),
            _ => None,
        }
    }

    fn error_value(detail: Option<&StatusDetail>) -> Option<&str> {
        match detail {
            Some(StatusDetail::Error(message)) => Some(message),
            _ => None,
        }
    }
}

/// Handle to the persistent task queue
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct TaskStore {
    db: SqlitePool,
}

impl TaskStore {
    /// Wrap an existing pool whose schema has already been created
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Open (or create) the database file and ensure the schema exists
    pub async fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(init_database(db_path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Insert a new `pending` task stamped with the current time
    pub async fn enqueue(
        &self,
        destination: DestinationId,
        query: &str,
        requester: &str,
        invite: Option<&str>,
    ) -> Result<TaskId> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidInput("query must not be empty".to_string()));
        }

        let id = Uuid::new_v4();
        let now = time::now_millis();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, destination, query, requester, invite, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(destination.as_i64())
        .bind(query)
        .bind(requester)
        .bind(invite)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        debug!(task_id = %id, %destination, "Enqueued task");
        Ok(id)
    }

    /// Insert a submission payload
    pub async fn enqueue_task(&self, task: &NewTask) -> Result<TaskId> {
        self.enqueue(
            task.destination,
            &task.query,
            &task.requester,
            task.invite.as_deref(),
        )
        .await
    }

    /// Claim the oldest pending task, moving it to `processing`
    pub async fn claim_next(&self) -> Result<Option<Task>> {
        self.claim(None, &[]).await
    }

    /// Claim the oldest pending task whose destination is not in `busy`
    ///
    /// Tasks for busy destinations stay `pending` for a later poll.
    pub async fn claim_next_excluding(&self, busy: &[DestinationId]) -> Result<Option<Task>> {
        self.claim(None, busy).await
    }

    /// Claim the oldest pending task of a single destination
    pub async fn claim_next_for(&self, destination: DestinationId) -> Result<Option<Task>> {
        self.claim(Some(destination), &[]).await
    }

    async fn claim(
        &self,
        only: Option<DestinationId>,
        busy: &[DestinationId],
    ) -> Result<Option<Task>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE tasks SET status = 'processing', updated_at = ",
        );
        qb.push_bind(time::now_millis());
        qb.push(" WHERE seq = (SELECT seq FROM tasks WHERE status = 'pending'");

        if let Some(destination) = only {
            qb.push(" AND destination = ");
            qb.push_bind(destination.as_i64());
        }

        if !busy.is_empty() {
            qb.push(" AND destination NOT IN (");
            let mut separated = qb.separated(", ");
            for destination in busy {
                separated.push_bind(destination.as_i64());
            }
            separated.push_unseparated(")");
        }

        qb.push(" ORDER BY created_at ASC, seq ASC LIMIT 1) AND status = 'pending' RETURNING ");
        qb.push(TASK_COLUMNS);

        let row = qb.build().fetch_optional(&self.db).await?;
        match row {
            Some(row) => {
                let task = task_from_row(&row)?;
                debug!(task_id = %task.id, destination = %task.destination, "Claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Compare-and-swap a task's status
    ///
    /// Returns `false` (and writes nothing) if the task is not currently in
    /// `from`, or if `from -> to` is not a forward edge of the lifecycle.
    pub async fn transition(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        detail: Option<&StatusDetail>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            warn!(task_id = %id, %from, %to, "Rejected illegal status transition");
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                updated_at = ?,
                title = COALESCE(?, title),
                error_detail = COALESCE(?, error_detail)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(time::now_millis())
        .bind(StatusDetail::title_value(detail))
        .bind(StatusDetail::error_value(detail))
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Write a status plus optional detail
    ///
    /// The write is guarded by the legal predecessors of `status` (and `status`
    /// itself, so re-setting is idempotent). Returns `false` when the task is
    /// in a state from which `status` cannot be reached.
    pub async fn set_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        detail: Option<StatusDetail>,
    ) -> Result<bool> {
        let detail = detail.as_ref();

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET status = ");
        qb.push_bind(status.as_str());
        qb.push(", updated_at = ");
        qb.push_bind(time::now_millis());
        qb.push(", title = COALESCE(");
        qb.push_bind(StatusDetail::title_value(detail).map(str::to_string));
        qb.push(", title), error_detail = COALESCE(");
        qb.push_bind(StatusDetail::error_value(detail).map(str::to_string));
        qb.push(", error_detail) WHERE id = ");
        qb.push_bind(id.to_string());
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        separated.push_bind(status.as_str());
        for predecessor in status.predecessors() {
            separated.push_bind(predecessor.as_str());
        }
        separated.push_unseparated(")");

        let result = qb.build().execute(&self.db).await?;
        let applied = result.rows_affected() > 0;
        if !applied {
            warn!(task_id = %id, %status, "Status write ignored (task missing or not in a predecessor state)");
        }
        Ok(applied)
    }

    /// Move every `pending` task of a destination to `skipped`
    ///
    /// `processing` and `playing` tasks are untouched.
    pub async fn skip_pending(&self, destination: DestinationId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'skipped', updated_at = ? WHERE destination = ? AND status = 'pending'",
        )
        .bind(time::now_millis())
        .bind(destination.as_i64())
        .execute(&self.db)
        .await?;

        let skipped = result.rows_affected();
        if skipped > 0 {
            info!(%destination, skipped, "Skipped pending tasks");
        }
        Ok(skipped)
    }

    /// Number of `pending` tasks for a destination (queue position display)
    pub async fn count_pending(&self, destination: DestinationId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE destination = ? AND status = 'pending'",
        )
        .bind(destination.as_i64())
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Like [`TaskStore::get`], but a missing task is an error
    pub async fn require(&self, id: TaskId) -> Result<Task> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))
    }

    /// All tasks in a status, oldest first
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = ? ORDER BY created_at ASC, seq ASC",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(task_from_row).collect()
    }

    /// Mark tasks orphaned by a previous worker run as `error`
    ///
    /// Only valid while a single worker owns the queue: a task that is
    /// `processing` or `playing` at startup has no live pipeline behind it.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'error',
                updated_at = ?,
                error_detail = 'interrupted by worker restart'
            WHERE status IN ('processing', 'playing')
            "#,
        )
        .bind(time::now_millis())
        .execute(&self.db)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "Marked interrupted tasks as error");
        }
        Ok(recovered)
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| Error::CorruptRecord(format!("invalid task id '{}': {}", id, e)))?;
    let status: String = row.try_get("status")?;

    Ok(Task {
        id,
        destination: DestinationId(row.try_get("destination")?),
        query: row.try_get("query")?,
        requester: row.try_get("requester")?,
        invite: row.try_get("invite")?,
        status: status.parse()?,
        title: row.try_get("title")?,
        error_detail: row.try_get("error_detail")?,
        created_at: time::from_millis(row.try_get("created_at")?),
    })
}
