//! SQLite implementation of the orchestration store.
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are embedded with
//! `sqlx::migrate!("./migrations")` (resolved against the crate root at
//! compile time) and run by [`SqliteStore::connect`].
//!
//! Queries use the runtime-checked `sqlx::query` form so no `DATABASE_URL`
//! is needed at build time. Every operation the engine relies on being atomic
//! is a single conditional statement.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use slipway_core::bootaction::{BootActionContext, BootActionRecord, BootActionStatus};
use slipway_core::builddata::{BuildData, latest_per_generator};
use slipway_core::leader::ActiveInstance;
use slipway_core::store::{
    BootActionStore, BuildDataStore, LeaderStore, StoreError, StoreResult, TaskStore,
};
use slipway_core::task::{ResultMessage, Task, TaskId};

use super::{parse_opt_ts, parse_ts, ts};

const TERMINAL: &str = "('complete', 'terminated')";

/// SQLite-backed orchestration store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://slipway.db"`, or
    /// `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // An in-memory database lives and dies with its connection, so pin the
        // pool to a single connection that is never recycled.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        }
        .connect_with(options)
        .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn subtask_ids(&self, parent_id: &str) -> StoreResult<Vec<TaskId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT child_id FROM task_subtasks WHERE parent_id = ?1 ORDER BY position",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id,)| parse_uuid(parent_id, "task_subtasks.child_id", &id))
            .collect()
    }

    async fn hydrate(&self, row: TaskRow) -> StoreResult<Task> {
        let subtasks = self.subtask_ids(&row.id).await?;
        row.into_task(subtasks)
    }
}

// ── Row types ────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    parent_task_id: Option<String>,
    action: String,
    status: String,
    result: String,
    retry: i64,
    design_ref: String,
    node_filter: Option<String>,
    request_context: Option<String>,
    created: String,
    created_by: Option<String>,
    updated: Option<String>,
    terminated: Option<String>,
    terminated_by: Option<String>,
    terminate: bool,
}

const TASK_COLUMNS: &str = "id, parent_task_id, action, status, result, retry, design_ref, \
     node_filter, request_context, created, created_by, updated, terminated, terminated_by, \
     terminate";

impl TaskRow {
    fn into_task(self, subtask_id_list: Vec<TaskId>) -> StoreResult<Task> {
        let id = self.id.as_str();
        Ok(Task {
            task_id: parse_uuid(id, "id", id)?,
            parent_task_id: self
                .parent_task_id
                .as_deref()
                .map(|p| parse_uuid(id, "parent_task_id", p))
                .transpose()?,
            subtask_id_list,
            action: self
                .action
                .parse()
                .map_err(|e| StoreError::malformed(id, "action", e))?,
            status: self
                .status
                .parse()
                .map_err(|e| StoreError::malformed(id, "status", e))?,
            result: serde_json::from_str(&self.result)?,
            retry: u32::try_from(self.retry).map_err(|e| StoreError::malformed(id, "retry", e))?,
            design_ref: self.design_ref,
            node_filter: self
                .node_filter
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            request_context: self
                .request_context
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created: parse_ts(id, "created", &self.created)?,
            created_by: self.created_by,
            updated: parse_opt_ts(id, "updated", self.updated.as_deref())?,
            terminated: parse_opt_ts(id, "terminated", self.terminated.as_deref())?,
            terminated_by: self.terminated_by,
            terminate: self.terminate,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    sequence: i64,
    task_id: String,
    message: String,
    error: bool,
    context: String,
    context_type: String,
    ts: String,
    extra: String,
}

impl TryFrom<MessageRow> for ResultMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> StoreResult<Self> {
        let seq = row.sequence.to_string();
        Ok(ResultMessage {
            sequence: row.sequence,
            task_id: parse_uuid(&seq, "task_id", &row.task_id)?,
            message: row.message,
            error: row.error,
            context: row.context,
            context_type: row.context_type,
            ts: parse_ts(&seq, "ts", &row.ts)?,
            extra: serde_json::from_str(&row.extra)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct BootActionRow {
    action_id: String,
    node_name: String,
    action_name: String,
    task_id: String,
    identity_key: Vec<u8>,
    action_status: String,
}

impl TryFrom<BootActionRow> for BootActionRecord {
    type Error = StoreError;

    fn try_from(row: BootActionRow) -> StoreResult<Self> {
        let id = row.action_id.as_str();
        Ok(BootActionRecord {
            action_id: parse_uuid(id, "action_id", id)?,
            task_id: parse_uuid(id, "task_id", &row.task_id)?,
            action_status: row
                .action_status
                .parse()
                .map_err(|e| StoreError::malformed(id, "action_status", e))?,
            node_name: row.node_name,
            action_name: row.action_name,
            identity_key: row.identity_key,
        })
    }
}

#[derive(Debug, FromRow)]
struct BuildDataRow {
    id: i64,
    node_name: String,
    task_id: String,
    collected_date: String,
    generator: String,
    data_format: String,
    data_element: String,
}

impl TryFrom<BuildDataRow> for BuildData {
    type Error = StoreError;

    fn try_from(row: BuildDataRow) -> StoreResult<Self> {
        let id = row.id.to_string();
        Ok(BuildData {
            task_id: parse_uuid(&id, "task_id", &row.task_id)?,
            collected_date: parse_ts(&id, "collected_date", &row.collected_date)?,
            node_name: row.node_name,
            generator: row.generator,
            data_format: row.data_format,
            data_element: row.data_element,
        })
    }
}

fn parse_uuid(id: &str, column: &'static str, raw: &str) -> StoreResult<Uuid> {
    raw.parse().map_err(|e| StoreError::malformed(id, column, e))
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> StoreResult<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(Into::into)
}

// ── TaskStore ────────────────────────────────────────────────────────────────

impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &Task) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tasks (id, parent_task_id, action, status, result, retry, design_ref, \
             node_filter, request_context, created, created_by, updated, terminated, \
             terminated_by, terminate) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(task.task_id.to_string())
        .bind(task.parent_task_id.map(|p| p.to_string()))
        .bind(task.action.as_ref())
        .bind(task.status.as_ref())
        .bind(serde_json::to_string(&task.result)?)
        .bind(i64::from(task.retry))
        .bind(&task.design_ref)
        .bind(to_json(&task.node_filter)?)
        .bind(to_json(&task.request_context)?)
        .bind(ts(&task.created))
        .bind(&task.created_by)
        .bind(task.updated.as_ref().map(ts))
        .bind(task.terminated.as_ref().map(ts))
        .bind(&task.terminated_by)
        .bind(task.terminate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE tasks SET parent_task_id = ?2, status = ?3, result = ?4, retry = ?5, \
             node_filter = ?6, updated = ?7, terminated = ?8, \
             terminated_by = COALESCE(?9, terminated_by), terminate = (terminate OR ?10) \
             WHERE id = ?1 AND status NOT IN {TERMINAL}"
        ))
        .bind(task.task_id.to_string())
        .bind(task.parent_task_id.map(|p| p.to_string()))
        .bind(task.status.as_ref())
        .bind(serde_json::to_string(&task.result)?)
        .bind(i64::from(task.retry))
        .bind(to_json(&task.node_filter)?)
        .bind(task.updated.as_ref().map(ts))
        .bind(task.terminated.as_ref().map(ts))
        .bind(&task.terminated_by)
        .bind(task.terminate)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_terminate(&self, task_id: TaskId, by: Option<&str>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET terminate = 1, terminated_by = COALESCE(terminated_by, ?2) \
             WHERE id = ?1",
        )
        .bind(task_id.to_string())
        .bind(by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_task(&self, task_id: TaskId) -> StoreResult<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
                .bind(task_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created"))
                .fetch_all(&self.pool)
                .await?;
        let links: Vec<(String, String)> = sqlx::query_as(
            "SELECT parent_id, child_id FROM task_subtasks ORDER BY parent_id, position",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut children: HashMap<String, Vec<TaskId>> = HashMap::new();
        for (parent, child) in links {
            let child = parse_uuid(&parent, "task_subtasks.child_id", &child)?;
            children.entry(parent).or_default().push(child);
        }
        rows.into_iter()
            .map(|row| {
                let subtasks = children.remove(&row.id).unwrap_or_default();
                row.into_task(subtasks)
            })
            .collect()
    }

    async fn get_subtasks(&self, parent_id: TaskId) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT t.* FROM tasks t JOIN task_subtasks s ON s.child_id = t.id \
             WHERE s.parent_id = ?1 ORDER BY s.position",
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(self.hydrate(row).await?);
        }
        Ok(tasks)
    }

    async fn add_subtask(&self, parent_id: TaskId, child_id: TaskId) -> StoreResult<bool> {
        let parent = parent_id.to_string();
        let child = child_id.to_string();
        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO task_subtasks (parent_id, child_id, position) \
             SELECT ?1, ?2, COALESCE((SELECT MAX(position) + 1 FROM task_subtasks \
                                      WHERE parent_id = ?1), 0) \
             WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ?1 AND status NOT IN {TERMINAL})"
        ))
        .bind(&parent)
        .bind(&child)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE tasks SET parent_task_id = ?1 WHERE id = ?2")
            .bind(&parent)
            .bind(&child)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn next_pending_task(&self) -> StoreResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'pending' AND parent_task_id IS NULL \
             ORDER BY created LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn post_result_message(&self, msg: &ResultMessage) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO result_message (task_id, message, error, context, context_type, ts, extra) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(msg.task_id.to_string())
        .bind(&msg.message)
        .bind(msg.error)
        .bind(&msg.context)
        .bind(&msg.context_type)
        .bind(ts(&msg.ts))
        .bind(serde_json::to_string(&msg.extra)?)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_result_messages(&self, task_id: TaskId) -> StoreResult<Vec<ResultMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT sequence, task_id, message, error, context, context_type, ts, extra \
             FROM result_message WHERE task_id = ?1 ORDER BY sequence",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResultMessage::try_from).collect()
    }
}

// ── LeaderStore ──────────────────────────────────────────────────────────────

impl LeaderStore for SqliteStore {
    async fn claim_leadership(
        &self,
        identity: Uuid,
        now: DateTime<Utc>,
        grace: TimeDelta,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO active_instance (dummy_key, identity, last_ping) VALUES (1, ?1, ?2) \
             ON CONFLICT (dummy_key) DO UPDATE \
             SET identity = excluded.identity, last_ping = excluded.last_ping \
             WHERE active_instance.identity = excluded.identity \
                OR active_instance.last_ping <= ?3",
        )
        .bind(identity.to_string())
        .bind(ts(&now))
        .bind(ts(&(now - grace)))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn maintain_leadership(&self, identity: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE active_instance SET last_ping = ?2 WHERE dummy_key = 1 AND identity = ?1",
        )
        .bind(identity.to_string())
        .bind(ts(&now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn abdicate_leadership(&self, identity: Uuid) -> StoreResult<bool> {
        let result =
            sqlx::query("DELETE FROM active_instance WHERE dummy_key = 1 AND identity = ?1")
                .bind(identity.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn current_leader(&self) -> StoreResult<Option<ActiveInstance>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT identity, last_ping FROM active_instance WHERE dummy_key = 1")
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(identity, last_ping)| {
            Ok(ActiveInstance {
                identity: parse_uuid("active_instance", "identity", &identity)?,
                last_ping: parse_ts("active_instance", "last_ping", &last_ping)?,
            })
        })
        .transpose()
    }
}

// ── BootActionStore ──────────────────────────────────────────────────────────

impl BootActionStore for SqliteStore {
    async fn post_boot_action_context(
        &self,
        node_name: &str,
        task_id: TaskId,
        identity_key: &[u8],
    ) -> StoreResult<(Vec<u8>, bool)> {
        let result = sqlx::query(
            "INSERT INTO boot_action (node_name, task_id, identity_key) VALUES (?1, ?2, ?3) \
             ON CONFLICT (node_name) DO UPDATE \
             SET task_id = excluded.task_id, identity_key = excluded.identity_key \
             WHERE boot_action.task_id <> excluded.task_id",
        )
        .bind(node_name)
        .bind(task_id.to_string())
        .bind(identity_key)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok((identity_key.to_vec(), true));
        }

        let ctx = self
            .get_boot_action_context(node_name)
            .await?
            .ok_or_else(|| StoreError::malformed(node_name, "boot_action", "context vanished"))?;
        Ok((ctx.identity_key, false))
    }

    async fn get_boot_action_context(
        &self,
        node_name: &str,
    ) -> StoreResult<Option<BootActionContext>> {
        let row: Option<(String, String, Vec<u8>)> = sqlx::query_as(
            "SELECT node_name, task_id, identity_key FROM boot_action WHERE node_name = ?1",
        )
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(node_name, task_id, identity_key)| {
            Ok(BootActionContext {
                task_id: parse_uuid(&node_name, "task_id", &task_id)?,
                node_name,
                identity_key,
            })
        })
        .transpose()
    }

    async fn put_boot_action(&self, record: &BootActionRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO boot_action_status \
             (action_id, node_name, action_name, task_id, identity_key, action_status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(record.action_id.to_string())
        .bind(&record.node_name)
        .bind(&record.action_name)
        .bind(record.task_id.to_string())
        .bind(&record.identity_key)
        .bind(record.action_status.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_boot_action(&self, action_id: Uuid) -> StoreResult<Option<BootActionRecord>> {
        let row: Option<BootActionRow> = sqlx::query_as(
            "SELECT action_id, node_name, action_name, task_id, identity_key, action_status \
             FROM boot_action_status WHERE action_id = ?1",
        )
        .bind(action_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(BootActionRecord::try_from).transpose()
    }

    async fn get_boot_actions_for_node(
        &self,
        node_name: &str,
        task_id: TaskId,
    ) -> StoreResult<Vec<BootActionRecord>> {
        let rows: Vec<BootActionRow> = sqlx::query_as(
            "SELECT action_id, node_name, action_name, task_id, identity_key, action_status \
             FROM boot_action_status WHERE node_name = ?1 AND task_id = ?2 \
             ORDER BY action_id",
        )
        .bind(node_name)
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BootActionRecord::try_from).collect()
    }

    async fn post_boot_action_status(
        &self,
        action_id: Uuid,
        status: BootActionStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE boot_action_status SET action_status = ?2 \
             WHERE action_id = ?1 AND action_status = 'requested'",
        )
        .bind(action_id.to_string())
        .bind(status.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ── BuildDataStore ───────────────────────────────────────────────────────────

impl BuildDataStore for SqliteStore {
    async fn put_build_data(&self, data: &BuildData) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO build_data \
             (node_name, task_id, collected_date, generator, data_format, data_element) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&data.node_name)
        .bind(data.task_id.to_string())
        .bind(ts(&data.collected_date))
        .bind(&data.generator)
        .bind(&data.data_format)
        .bind(&data.data_element)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_build_data(&self, node_name: &str, latest: bool) -> StoreResult<Vec<BuildData>> {
        let rows: Vec<BuildDataRow> = sqlx::query_as(
            "SELECT id, node_name, task_id, collected_date, generator, data_format, data_element \
             FROM build_data WHERE node_name = ?1 ORDER BY collected_date DESC",
        )
        .bind(node_name)
        .fetch_all(&self.pool)
        .await?;
        let rows = rows
            .into_iter()
            .map(BuildData::try_from)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(if latest {
            latest_per_generator(rows)
        } else {
            rows
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
