//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::*;
use crate::error::{Error, Result};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or(Value::Null)
}

fn parse_enum<T: std::str::FromStr>(s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unparseable enum value '{}'", s).into(),
        )
    })
}

/// SQLite-backed entity store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- WAL for concurrent reads during writes; must be set before
            -- any transaction begins
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                net_key TEXT,
                plan TEXT NOT NULL,
                next_color INTEGER NOT NULL DEFAULT 1,
                canceled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                parent_method_id TEXT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                topological_index INTEGER NOT NULL,
                parallel_by TEXT,
                canceled INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS methods (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                name TEXT NOT NULL,
                idx INTEGER NOT NULL,
                kind TEXT NOT NULL,
                parameters TEXT NOT NULL,
                service_url TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS links (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                source_task_id TEXT NOT NULL,
                destination_task_id TEXT NOT NULL,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS data_flow_entries (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                link_id TEXT NOT NULL,
                source_property TEXT NOT NULL,
                destination_property TEXT NOT NULL,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS input_sources (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                destination_task_id TEXT NOT NULL,
                destination_property TEXT NOT NULL,
                source_task_id TEXT NOT NULL,
                source_property TEXT NOT NULL,
                parallel_depths TEXT NOT NULL,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                owner_kind TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                color INTEGER NOT NULL,
                parent_color INTEGER,
                colors TEXT NOT NULL,
                begins TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                outputs TEXT,
                job_url TEXT,
                response_links TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE,
                UNIQUE (owner_kind, owner_id, color)
            );

            CREATE TABLE IF NOT EXISTS status_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                name TEXT NOT NULL,
                color INTEGER NOT NULL,
                parent_color INTEGER,
                data TEXT NOT NULL,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE,
                UNIQUE (task_id, name, color)
            );

            CREATE TABLE IF NOT EXISTS color_groups (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                begin_color INTEGER NOT NULL,
                end_color INTEGER NOT NULL,
                parent_color INTEGER,
                parent_color_group_id TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS webhooks (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                owner_kind TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                status_name TEXT NOT NULL,
                url TEXT NOT NULL,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                workflow_id TEXT,
                url TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_methods_task ON methods(task_id, idx);
            CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_task_id);
            CREATE INDEX IF NOT EXISTS idx_entries_link ON data_flow_entries(link_id);
            CREATE INDEX IF NOT EXISTS idx_sources_destination
                ON input_sources(destination_task_id);
            CREATE INDEX IF NOT EXISTS idx_executions_owner
                ON executions(owner_kind, owner_id, color);
            CREATE INDEX IF NOT EXISTS idx_history_execution
                ON status_history(execution_id, seq);
            CREATE INDEX IF NOT EXISTS idx_results_task ON results(task_id, name, color);
            CREATE INDEX IF NOT EXISTS idx_groups_task ON color_groups(task_id);
            CREATE INDEX IF NOT EXISTS idx_webhooks_owner ON webhooks(owner_kind, owner_id);
            CREATE INDEX IF NOT EXISTS idx_notifications_due
                ON notifications(status, next_attempt_at);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` inside one transaction; commit on success, roll back on
    /// error. This is the single mutation path: one inbound callback, one
    /// transaction.
    pub async fn with_tx<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        match f(&Tx { conn: &tx }) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Drop rolls the transaction back.
                Err(e)
            }
        }
    }

    /// Run a read-only closure against the current state.
    pub async fn read<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().await;
        f(&Tx { conn: &conn })
    }
}

/// Entity operations available inside one transaction.
pub struct Tx<'a> {
    conn: &'a Connection,
}

// ============================================================================
// Workflows
// ============================================================================

impl Tx<'_> {
    pub fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO workflows (id, name, net_key, plan, next_color, canceled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                workflow.id,
                workflow.name,
                workflow.net_key,
                serde_json::to_string(&workflow.plan)?,
                workflow.next_color,
                workflow.canceled,
                workflow.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> Result<Workflow> {
        self.conn
            .query_row(
                "SELECT id, name, net_key, plan, next_color, canceled, created_at
                 FROM workflows WHERE id = ?1",
                [id],
                row_to_workflow,
            )
            .optional()?
            .ok_or_else(|| Error::NoSuchEntity {
                kind: "workflow",
                id: id.to_string(),
            })
    }

    pub fn find_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, net_key, plan, next_color, canceled, created_at
                 FROM workflows WHERE name = ?1",
                [name],
                row_to_workflow,
            )
            .optional()?)
    }

    pub fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, net_key, plan, next_color, canceled, created_at
             FROM workflows ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_workflow)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn set_net_key(&self, workflow_id: &str, net_key: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE workflows SET net_key = ?1 WHERE id = ?2",
            params![net_key, workflow_id],
        )?;
        Ok(())
    }

    /// Mark the workflow and all its tasks canceled.
    pub fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE workflows SET canceled = 1 WHERE id = ?1",
            [workflow_id],
        )?;
        self.conn.execute(
            "UPDATE tasks SET canceled = 1 WHERE workflow_id = ?1",
            [workflow_id],
        )?;
        Ok(())
    }

    /// Allocate `count` contiguous colors; returns the begin of the range.
    pub fn allocate_colors(&self, workflow_id: &str, count: i64) -> Result<i64> {
        let begin: i64 = self.conn.query_row(
            "SELECT next_color FROM workflows WHERE id = ?1",
            [workflow_id],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "UPDATE workflows SET next_color = next_color + ?1 WHERE id = ?2",
            params![count, workflow_id],
        )?;
        Ok(begin)
    }

    /// Cascading delete of a workflow and everything it owns.
    pub fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM workflows WHERE id = ?1", [workflow_id])?;
        if deleted == 0 {
            return Err(Error::NoSuchEntity {
                kind: "workflow",
                id: workflow_id.to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tasks and methods
// ============================================================================

impl Tx<'_> {
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tasks
                 (id, workflow_id, parent_method_id, name, kind,
                  topological_index, parallel_by, canceled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                task.workflow_id,
                task.parent_method_id,
                task.name,
                task.kind.to_string(),
                task.topological_index,
                task.parallel_by,
                task.canceled,
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.conn
            .query_row(
                "SELECT id, workflow_id, parent_method_id, name, kind,
                        topological_index, parallel_by, canceled
                 FROM tasks WHERE id = ?1",
                [id],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| Error::NoSuchEntity {
                kind: "task",
                id: id.to_string(),
            })
    }

    pub fn tasks_for_workflow(&self, workflow_id: &str) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workflow_id, parent_method_id, name, kind,
                    topological_index, parallel_by, canceled
             FROM tasks WHERE workflow_id = ?1
             ORDER BY topological_index, name",
        )?;
        let rows = stmt.query_map([workflow_id], row_to_task)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn insert_method(&self, method: &Method) -> Result<()> {
        self.conn.execute(
            "INSERT INTO methods
                 (id, workflow_id, task_id, name, idx, kind, parameters, service_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                method.id,
                method.workflow_id,
                method.task_id,
                method.name,
                method.index,
                method.kind.to_string(),
                serde_json::to_string(&method.parameters)?,
                method.service_url,
            ],
        )?;
        Ok(())
    }

    pub fn get_method(&self, id: &str) -> Result<Method> {
        self.conn
            .query_row(
                "SELECT id, workflow_id, task_id, name, idx, kind, parameters, service_url
                 FROM methods WHERE id = ?1",
                [id],
                row_to_method,
            )
            .optional()?
            .ok_or_else(|| Error::NoSuchEntity {
                kind: "method",
                id: id.to_string(),
            })
    }

    pub fn methods_for_task(&self, task_id: &str) -> Result<Vec<Method>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workflow_id, task_id, name, idx, kind, parameters, service_url
             FROM methods WHERE task_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt.query_map([task_id], row_to_method)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

// ============================================================================
// Links and data flow
// ============================================================================

impl Tx<'_> {
    pub fn insert_link(&self, link: &Link) -> Result<()> {
        self.conn.execute(
            "INSERT INTO links (id, workflow_id, source_task_id, destination_task_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                link.id,
                link.workflow_id,
                link.source_task_id,
                link.destination_task_id,
            ],
        )?;
        Ok(())
    }

    pub fn insert_data_flow_entry(&self, workflow_id: &str, entry: &DataFlowEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO data_flow_entries
                 (id, workflow_id, link_id, source_property, destination_property)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                workflow_id,
                entry.link_id,
                entry.source_property,
                entry.destination_property,
            ],
        )?;
        Ok(())
    }

    /// Distinct properties other tasks consume from this task; these are
    /// the outputs a succeeded job must have reported.
    pub fn required_outputs(&self, task_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT e.source_property
             FROM data_flow_entries e
             JOIN links l ON l.id = e.link_id
             WHERE l.source_task_id = ?1
             ORDER BY e.source_property",
        )?;
        let rows = stmt.query_map([task_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn insert_input_source(&self, source: &InputSource) -> Result<()> {
        self.conn.execute(
            "INSERT INTO input_sources
                 (id, workflow_id, destination_task_id, destination_property,
                  source_task_id, source_property, parallel_depths)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                source.id,
                source.workflow_id,
                source.destination_task_id,
                source.destination_property,
                source.source_task_id,
                source.source_property,
                serde_json::to_string(&source.parallel_depths)?,
            ],
        )?;
        Ok(())
    }

    pub fn input_sources_for(&self, destination_task_id: &str) -> Result<Vec<InputSource>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workflow_id, destination_task_id, destination_property,
                    source_task_id, source_property, parallel_depths
             FROM input_sources WHERE destination_task_id = ?1
             ORDER BY destination_property",
        )?;
        let rows = stmt.query_map([destination_task_id], row_to_input_source)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn input_source(
        &self,
        destination_task_id: &str,
        destination_property: &str,
    ) -> Result<Option<InputSource>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, workflow_id, destination_task_id, destination_property,
                        source_task_id, source_property, parallel_depths
                 FROM input_sources
                 WHERE destination_task_id = ?1 AND destination_property = ?2",
                params![destination_task_id, destination_property],
                row_to_input_source,
            )
            .optional()?)
    }
}

// ============================================================================
// Executions and status history
// ============================================================================

impl Tx<'_> {
    pub fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.conn.execute(
            "INSERT INTO executions
                 (id, workflow_id, owner_kind, owner_id, color, parent_color,
                  colors, begins, status, data, outputs, job_url,
                  response_links, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                execution.id,
                execution.workflow_id,
                execution.owner_kind.to_string(),
                execution.owner_id,
                execution.color,
                execution.parent_color,
                serde_json::to_string(&execution.colors)?,
                serde_json::to_string(&execution.begins)?,
                execution.status.to_string(),
                serde_json::to_string(&execution.data)?,
                execution
                    .outputs
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                execution.job_url,
                serde_json::to_string(&execution.response_links)?,
                execution.created_at.to_rfc3339(),
            ],
        )?;
        self.append_status(&execution.id, execution.status)?;
        Ok(())
    }

    pub fn get_execution(&self, id: &str) -> Result<Execution> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_EXECUTION),
                [id],
                row_to_execution,
            )
            .optional()?
            .ok_or_else(|| Error::NoSuchEntity {
                kind: "execution",
                id: id.to_string(),
            })
    }

    pub fn find_execution(
        &self,
        owner_kind: OwnerKind,
        owner_id: &str,
        color: i64,
    ) -> Result<Option<Execution>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "{} WHERE owner_kind = ?1 AND owner_id = ?2 AND color = ?3",
                    SELECT_EXECUTION
                ),
                params![owner_kind.to_string(), owner_id, color],
                row_to_execution,
            )
            .optional()?)
    }

    pub fn executions_for_owner(
        &self,
        owner_kind: OwnerKind,
        owner_id: &str,
    ) -> Result<Vec<Execution>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE owner_kind = ?1 AND owner_id = ?2 ORDER BY color",
            SELECT_EXECUTION
        ))?;
        let rows = stmt.query_map(params![owner_kind.to_string(), owner_id], row_to_execution)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Advance an execution's status, appending to its history. Returns
    /// false (and changes nothing) when the transition is not allowed, so
    /// duplicate deliveries are idempotent.
    pub fn advance_status(&self, execution_id: &str, status: Status) -> Result<bool> {
        let current = self.get_execution(execution_id)?.status;
        if !current.can_advance_to(status) {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE executions SET status = ?1 WHERE id = ?2",
            params![status.to_string(), execution_id],
        )?;
        self.append_status(execution_id, status)?;
        Ok(true)
    }

    fn append_status(&self, execution_id: &str, status: Status) -> Result<()> {
        self.conn.execute(
            "INSERT INTO status_history (execution_id, status, created_at)
             VALUES (?1, ?2, ?3)",
            params![execution_id, status.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn status_history(&self, execution_id: &str) -> Result<Vec<StatusEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, created_at FROM status_history
             WHERE execution_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map([execution_id], |row| {
            Ok(StatusEntry {
                status: parse_enum(&row.get::<_, String>(0)?)?,
                created_at: parse_datetime_utc(&row.get::<_, String>(1)?)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn set_execution_outputs(&self, execution_id: &str, outputs: &Value) -> Result<()> {
        self.conn.execute(
            "UPDATE executions SET outputs = ?1 WHERE id = ?2",
            params![serde_json::to_string(outputs)?, execution_id],
        )?;
        Ok(())
    }

    pub fn set_execution_data(&self, execution_id: &str, data: &Value) -> Result<()> {
        self.conn.execute(
            "UPDATE executions SET data = ?1 WHERE id = ?2",
            params![serde_json::to_string(data)?, execution_id],
        )?;
        Ok(())
    }

    pub fn set_execution_job_url(&self, execution_id: &str, job_url: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE executions SET job_url = ?1 WHERE id = ?2",
            params![job_url, execution_id],
        )?;
        Ok(())
    }

    pub fn set_execution_response_links(&self, execution_id: &str, links: &Value) -> Result<()> {
        self.conn.execute(
            "UPDATE executions SET response_links = ?1 WHERE id = ?2",
            params![serde_json::to_string(links)?, execution_id],
        )?;
        Ok(())
    }

    /// Executions of a workflow whose job is still in flight, for
    /// cancellation fan-out.
    pub fn running_job_executions(&self, workflow_id: &str) -> Result<Vec<Execution>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE workflow_id = ?1 AND job_url IS NOT NULL
                 AND status IN ('scheduled', 'running')",
            SELECT_EXECUTION
        ))?;
        let rows = stmt.query_map([workflow_id], row_to_execution)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

// ============================================================================
// Results and color groups
// ============================================================================

impl Tx<'_> {
    /// Insert or replace a task result; redelivered callbacks overwrite
    /// with identical data.
    pub fn upsert_result(&self, result: &TaskResult) -> Result<()> {
        self.conn.execute(
            "INSERT INTO results
                 (id, workflow_id, task_id, name, color, parent_color, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (task_id, name, color) DO UPDATE SET
                 data = excluded.data, parent_color = excluded.parent_color",
            params![
                result.id,
                result.workflow_id,
                result.task_id,
                result.name,
                result.color,
                result.parent_color,
                serde_json::to_string(&result.data)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_result(&self, task_id: &str, name: &str, color: i64) -> Result<Option<TaskResult>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, workflow_id, task_id, name, color, parent_color, data
                 FROM results WHERE task_id = ?1 AND name = ?2 AND color = ?3",
                params![task_id, name, color],
                row_to_result,
            )
            .optional()?)
    }

    /// Distinct result names of a task within a color range, ordered.
    pub fn result_names_in_range(
        &self,
        task_id: &str,
        begin: i64,
        end: i64,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT name FROM results
             WHERE task_id = ?1 AND color >= ?2 AND color < ?3
             ORDER BY name",
        )?;
        let rows = stmt.query_map(params![task_id, begin, end], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Per-color results of one name within a range, ordered by color.
    pub fn results_in_range(
        &self,
        task_id: &str,
        name: &str,
        begin: i64,
        end: i64,
    ) -> Result<Vec<TaskResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workflow_id, task_id, name, color, parent_color, data
             FROM results
             WHERE task_id = ?1 AND name = ?2 AND color >= ?3 AND color < ?4
             ORDER BY color",
        )?;
        let rows = stmt.query_map(params![task_id, name, begin, end], row_to_result)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn results_for_task_at_color(&self, task_id: &str, color: i64) -> Result<Vec<TaskResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workflow_id, task_id, name, color, parent_color, data
             FROM results WHERE task_id = ?1 AND color = ?2 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![task_id, color], row_to_result)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn insert_color_group(&self, group: &ColorGroup) -> Result<()> {
        self.conn.execute(
            "INSERT INTO color_groups
                 (id, workflow_id, task_id, idx, begin_color, end_color,
                  parent_color, parent_color_group_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                group.id,
                group.workflow_id,
                group.task_id,
                group.index,
                group.begin,
                group.end,
                group.parent_color,
                group.parent_color_group_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_color_group(&self, id: &str) -> Result<ColorGroup> {
        self.conn
            .query_row(
                "SELECT id, workflow_id, task_id, idx, begin_color, end_color,
                        parent_color, parent_color_group_id
                 FROM color_groups WHERE id = ?1",
                [id],
                row_to_color_group,
            )
            .optional()?
            .ok_or_else(|| Error::NoSuchEntity {
                kind: "color group",
                id: id.to_string(),
            })
    }

    /// The group a task's split created under one parent color.
    pub fn find_color_group(
        &self,
        task_id: &str,
        parent_color: Option<i64>,
    ) -> Result<Option<ColorGroup>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, workflow_id, task_id, idx, begin_color, end_color,
                        parent_color, parent_color_group_id
                 FROM color_groups
                 WHERE task_id = ?1 AND parent_color IS ?2",
                params![task_id, parent_color],
                row_to_color_group,
            )
            .optional()?)
    }

    /// The group containing a color, if any.
    pub fn group_containing(&self, workflow_id: &str, color: i64) -> Result<Option<ColorGroup>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, workflow_id, task_id, idx, begin_color, end_color,
                        parent_color, parent_color_group_id
                 FROM color_groups
                 WHERE workflow_id = ?1 AND begin_color <= ?2 AND end_color > ?2",
                params![workflow_id, color],
                row_to_color_group,
            )
            .optional()?)
    }
}

// ============================================================================
// Webhooks and notifications
// ============================================================================

impl Tx<'_> {
    pub fn insert_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.conn.execute(
            "INSERT INTO webhooks (id, workflow_id, owner_kind, owner_id, status_name, url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                webhook.id,
                webhook.workflow_id,
                webhook.owner_kind.to_string(),
                webhook.owner_id,
                webhook.status_name,
                webhook.url,
            ],
        )?;
        Ok(())
    }

    /// Webhooks of one owner matching a status transition. Terminal
    /// statuses also satisfy a generic "ended" subscription.
    pub fn webhooks_matching(
        &self,
        owner_kind: OwnerKind,
        owner_id: &str,
        status: Status,
    ) -> Result<Vec<Webhook>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workflow_id, owner_kind, owner_id, status_name, url
             FROM webhooks
             WHERE owner_kind = ?1 AND owner_id = ?2
               AND (status_name = ?3 OR (status_name = 'ended' AND ?4))
             ORDER BY url",
        )?;
        let rows = stmt.query_map(
            params![
                owner_kind.to_string(),
                owner_id,
                status.to_string(),
                status.is_terminal(),
            ],
            row_to_webhook,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Queue an outbound notification; the dispatcher flushes it after the
    /// transaction commits.
    pub fn enqueue_notification(
        &self,
        workflow_id: Option<&str>,
        url: &str,
        payload: &Value,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO notifications
                 (id, workflow_id, url, payload, attempts, next_attempt_at, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, 'pending', ?5)",
            params![id, workflow_id, url, serde_json::to_string(payload)?, now],
        )?;
        Ok(id)
    }

    pub fn due_notifications(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workflow_id, url, payload, attempts, next_attempt_at, status, created_at
             FROM notifications
             WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY next_attempt_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339(), limit as i64], row_to_notification)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn mark_notification_sent(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE notifications SET status = 'sent' WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    pub fn reschedule_notification(
        &self,
        id: &str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE notifications SET attempts = ?1, next_attempt_at = ?2 WHERE id = ?3",
            params![attempts, next_attempt_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn abandon_notification(&self, id: &str, attempts: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE notifications SET status = 'abandoned', attempts = ?1 WHERE id = ?2",
            params![attempts, id],
        )?;
        Ok(())
    }

    pub fn notifications_for_workflow(&self, workflow_id: &str) -> Result<Vec<Notification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workflow_id, url, payload, attempts, next_attempt_at, status, created_at
             FROM notifications WHERE workflow_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([workflow_id], row_to_notification)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

// ============================================================================
// Row mappers
// ============================================================================

const SELECT_EXECUTION: &str = "SELECT id, workflow_id, owner_kind, owner_id, color, parent_color,
        colors, begins, status, data, outputs, job_url, response_links, created_at
 FROM executions";

fn row_to_workflow(row: &Row) -> rusqlite::Result<Workflow> {
    Ok(Workflow {
        id: row.get(0)?,
        name: row.get(1)?,
        net_key: row.get(2)?,
        plan: parse_json(&row.get::<_, String>(3)?),
        next_color: row.get(4)?,
        canceled: row.get(5)?,
        created_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
    })
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        parent_method_id: row.get(2)?,
        name: row.get(3)?,
        kind: parse_enum(&row.get::<_, String>(4)?)?,
        topological_index: row.get(5)?,
        parallel_by: row.get(6)?,
        canceled: row.get(7)?,
    })
}

fn row_to_method(row: &Row) -> rusqlite::Result<Method> {
    Ok(Method {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        task_id: row.get(2)?,
        name: row.get(3)?,
        index: row.get(4)?,
        kind: parse_enum(&row.get::<_, String>(5)?)?,
        parameters: parse_json(&row.get::<_, String>(6)?),
        service_url: row.get(7)?,
    })
}

fn row_to_input_source(row: &Row) -> rusqlite::Result<InputSource> {
    let depths: String = row.get(6)?;
    Ok(InputSource {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        destination_task_id: row.get(2)?,
        destination_property: row.get(3)?,
        source_task_id: row.get(4)?,
        source_property: row.get(5)?,
        parallel_depths: serde_json::from_str(&depths).unwrap_or_default(),
    })
}

fn row_to_execution(row: &Row) -> rusqlite::Result<Execution> {
    let colors: String = row.get(6)?;
    let begins: String = row.get(7)?;
    let outputs: Option<String> = row.get(10)?;
    Ok(Execution {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        owner_kind: parse_enum(&row.get::<_, String>(2)?)?,
        owner_id: row.get(3)?,
        color: row.get(4)?,
        parent_color: row.get(5)?,
        colors: serde_json::from_str(&colors).unwrap_or_default(),
        begins: serde_json::from_str(&begins).unwrap_or_default(),
        status: parse_enum(&row.get::<_, String>(8)?)?,
        data: parse_json(&row.get::<_, String>(9)?),
        outputs: outputs.as_deref().map(parse_json),
        job_url: row.get(11)?,
        response_links: parse_json(&row.get::<_, String>(12)?),
        created_at: parse_datetime_utc(&row.get::<_, String>(13)?)?,
    })
}

fn row_to_result(row: &Row) -> rusqlite::Result<TaskResult> {
    Ok(TaskResult {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        task_id: row.get(2)?,
        name: row.get(3)?,
        color: row.get(4)?,
        parent_color: row.get(5)?,
        data: parse_json(&row.get::<_, String>(6)?),
    })
}

fn row_to_color_group(row: &Row) -> rusqlite::Result<ColorGroup> {
    Ok(ColorGroup {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        task_id: row.get(2)?,
        index: row.get(3)?,
        begin: row.get(4)?,
        end: row.get(5)?,
        parent_color: row.get(6)?,
        parent_color_group_id: row.get(7)?,
    })
}

fn row_to_webhook(row: &Row) -> rusqlite::Result<Webhook> {
    Ok(Webhook {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        owner_kind: parse_enum(&row.get::<_, String>(2)?)?,
        owner_id: row.get(3)?,
        status_name: row.get(4)?,
        url: row.get(5)?,
    })
}

fn row_to_notification(row: &Row) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        url: row.get(2)?,
        payload: parse_json(&row.get::<_, String>(3)?),
        attempts: row.get(4)?,
        next_attempt_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
        status: parse_enum(&row.get::<_, String>(6)?)?,
        created_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow(tx: &Tx<'_>) -> Workflow {
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            name: "sample".into(),
            net_key: None,
            plan: json!({"initialMarking": [], "transitions": []}),
            next_color: 1,
            canceled: false,
            created_at: Utc::now(),
        };
        tx.insert_workflow(&workflow).unwrap();
        workflow
    }

    fn sample_execution(workflow_id: &str, owner_id: &str, color: i64) -> Execution {
        Execution {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            owner_kind: OwnerKind::Method,
            owner_id: owner_id.to_string(),
            color,
            parent_color: None,
            colors: vec![color],
            begins: vec![0],
            status: Status::New,
            data: json!({}),
            outputs: None,
            job_url: None,
            response_links: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .with_tx(|tx| {
                let workflow = sample_workflow(tx);
                Ok(workflow.id)
            })
            .await
            .unwrap();

        let loaded = store.read(|tx| tx.get_workflow(&id)).await.unwrap();
        assert_eq!(loaded.name, "sample");
        assert_eq!(loaded.next_color, 1);
        assert!(!loaded.canceled);

        let by_name = store
            .read(|tx| tx.find_workflow_by_name("sample"))
            .await
            .unwrap();
        assert_eq!(by_name.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<()> = store
            .with_tx(|tx| {
                sample_workflow(tx);
                Err(Error::Internal("boom".into()))
            })
            .await;
        assert!(result.is_err());

        let found = store
            .read(|tx| tx.find_workflow_by_name("sample"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_status_advances_append_history() {
        let store = Store::open_in_memory().unwrap();
        let execution_id = store
            .with_tx(|tx| {
                let workflow = sample_workflow(tx);
                let execution = sample_execution(&workflow.id, "m1", 0);
                tx.insert_execution(&execution)?;

                assert!(tx.advance_status(&execution.id, Status::Scheduled)?);
                assert!(tx.advance_status(&execution.id, Status::Running)?);
                // Duplicate delivery is a no-op.
                assert!(!tx.advance_status(&execution.id, Status::Running)?);
                assert!(tx.advance_status(&execution.id, Status::Succeeded)?);
                // Terminal is immutable.
                assert!(!tx.advance_status(&execution.id, Status::Failed)?);
                Ok(execution.id)
            })
            .await
            .unwrap();

        let history = store
            .read(|tx| tx.status_history(&execution_id))
            .await
            .unwrap();
        let statuses: Vec<Status> = history.iter().map(|entry| entry.status).collect();
        assert_eq!(
            statuses,
            vec![
                Status::New,
                Status::Scheduled,
                Status::Running,
                Status::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_execution_unique_per_owner_and_color() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<()> = store
            .with_tx(|tx| {
                let workflow = sample_workflow(tx);
                tx.insert_execution(&sample_execution(&workflow.id, "m1", 0))?;
                tx.insert_execution(&sample_execution(&workflow.id, "m1", 0))?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_color_allocation_is_contiguous() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let workflow = sample_workflow(tx);
                assert_eq!(tx.allocate_colors(&workflow.id, 3)?, 1);
                assert_eq!(tx.allocate_colors(&workflow.id, 2)?, 4);
                assert_eq!(tx.get_workflow(&workflow.id)?.next_color, 6);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_results_ordered_by_color_in_range() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let workflow = sample_workflow(tx);
                for (color, value) in [(3, "c"), (1, "a"), (2, "b")] {
                    tx.upsert_result(&TaskResult {
                        id: Uuid::new_v4().to_string(),
                        workflow_id: workflow.id.clone(),
                        task_id: "t1".into(),
                        name: "out".into(),
                        color,
                        parent_color: Some(0),
                        data: json!(value),
                    })?;
                }

                let in_range = tx.results_in_range("t1", "out", 1, 4)?;
                let values: Vec<Value> = in_range.into_iter().map(|r| r.data).collect();
                assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);

                assert_eq!(tx.result_names_in_range("t1", 1, 4)?, vec!["out"]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cascade_delete_removes_owned_rows() {
        let store = Store::open_in_memory().unwrap();
        let (workflow_id, execution_id) = store
            .with_tx(|tx| {
                let workflow = sample_workflow(tx);
                let execution = sample_execution(&workflow.id, "m1", 0);
                tx.insert_execution(&execution)?;
                tx.upsert_result(&TaskResult {
                    id: Uuid::new_v4().to_string(),
                    workflow_id: workflow.id.clone(),
                    task_id: "t1".into(),
                    name: "out".into(),
                    color: 0,
                    parent_color: None,
                    data: json!(1),
                })?;
                Ok((workflow.id, execution.id))
            })
            .await
            .unwrap();

        store
            .with_tx(|tx| tx.delete_workflow(&workflow_id))
            .await
            .unwrap();

        let gone = store.read(|tx| tx.get_execution(&execution_id)).await;
        assert!(matches!(gone, Err(Error::NoSuchEntity { .. })));
        let results = store
            .read(|tx| tx.results_for_task_at_color("t1", 0))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_webhooks_ended_synonym_matches_terminal_statuses() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let workflow = sample_workflow(tx);
                for (status_name, url) in [
                    ("succeeded", "http://hooks/ok"),
                    ("ended", "http://hooks/any-end"),
                    ("running", "http://hooks/progress"),
                ] {
                    tx.insert_webhook(&Webhook {
                        id: Uuid::new_v4().to_string(),
                        workflow_id: workflow.id.clone(),
                        owner_kind: OwnerKind::Task,
                        owner_id: "t1".into(),
                        status_name: status_name.into(),
                        url: url.into(),
                    })?;
                }

                let on_success = tx.webhooks_matching(OwnerKind::Task, "t1", Status::Succeeded)?;
                let urls: Vec<&str> = on_success.iter().map(|w| w.url.as_str()).collect();
                assert_eq!(urls, vec!["http://hooks/any-end", "http://hooks/ok"]);

                let on_failure = tx.webhooks_matching(OwnerKind::Task, "t1", Status::Failed)?;
                assert_eq!(on_failure.len(), 1);
                assert_eq!(on_failure[0].url, "http://hooks/any-end");

                let on_running = tx.webhooks_matching(OwnerKind::Task, "t1", Status::Running)?;
                assert_eq!(on_running.len(), 1);
                assert_eq!(on_running[0].url, "http://hooks/progress");
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notification_queue_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .with_tx(|tx| tx.enqueue_notification(None, "http://substrate/p", &json!({"ok": true})))
            .await
            .unwrap();

        let due = store
            .read(|tx| tx.due_notifications(Utc::now(), 10))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);

        store
            .with_tx(|tx| {
                tx.reschedule_notification(&id, 1, Utc::now() + chrono::Duration::seconds(60))
            })
            .await
            .unwrap();
        let due = store
            .read(|tx| tx.due_notifications(Utc::now(), 10))
            .await
            .unwrap();
        assert!(due.is_empty());

        store
            .with_tx(|tx| tx.mark_notification_sent(&id))
            .await
            .unwrap();
        let due = store
            .read(|tx| tx.due_notifications(Utc::now() + chrono::Duration::hours(1), 10))
            .await
            .unwrap();
        assert!(due.is_empty());
    }
}
