use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use hearth_core::chain::*;
use hearth_core::error::{HearthError, Result};
use hearth_core::record::ExecutionRecord;
use hearth_core::traits::{ChainSource, RecordSink};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chains (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        enabled INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS chain_steps (
        chain_id INTEGER NOT NULL,
        id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        key TEXT,
        tool TEXT NOT NULL,
        args TEXT NOT NULL DEFAULT '{}',
        on_failure TEXT,
        timeout_secs INTEGER,
        PRIMARY KEY (chain_id, id)
    );

    CREATE TABLE IF NOT EXISTS chain_actions (
        chain_id INTEGER NOT NULL,
        id INTEGER NOT NULL,
        step_id INTEGER,
        parent_action_id INTEGER,
        branch TEXT NOT NULL DEFAULT 'then',
        position INTEGER NOT NULL DEFAULT 0,
        kind TEXT NOT NULL,
        tool TEXT,
        args TEXT,
        key TEXT,
        timeout_secs INTEGER,
        terminal_status TEXT,
        message TEXT,
        PRIMARY KEY (chain_id, id)
    );

    CREATE TABLE IF NOT EXISTS chain_condition_groups (
        chain_id INTEGER NOT NULL,
        id INTEGER NOT NULL,
        step_id INTEGER,
        action_id INTEGER,
        combinator TEXT NOT NULL DEFAULT 'and',
        PRIMARY KEY (chain_id, id)
    );

    CREATE TABLE IF NOT EXISTS chain_conditions (
        chain_id INTEGER NOT NULL,
        id INTEGER NOT NULL,
        group_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        operator TEXT NOT NULL,
        value TEXT NOT NULL DEFAULT 'null',
        position INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (chain_id, id)
    );

    CREATE TABLE IF NOT EXISTS execution_records (
        run_id TEXT PRIMARY KEY,
        chain_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        caller TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        record TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_records_chain
        ON execution_records(chain_id, started_at DESC);
";

const CHAIN_TABLES: [&str; 5] = [
    "chain_conditions",
    "chain_condition_groups",
    "chain_actions",
    "chain_steps",
    "chains",
];

fn db(e: rusqlite::Error) -> HearthError {
    HearthError::Database(e.to_string())
}

/// SQLite-backed chain definitions and execution records.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HearthError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| HearthError::Database(e.to_string()))
    }

    /// Store a chain definition, replacing any chain with the same id.
    pub fn save_chain(&self, def: &ChainDefinition) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let chain_id = def.chain.id.0;

        for table in CHAIN_TABLES {
            let column = if table == "chains" { "id" } else { "chain_id" };
            tx.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", table, column),
                params![chain_id],
            )
            .map_err(db)?;
        }

        tx.execute(
            "INSERT INTO chains (id, name, description, enabled) VALUES (?1, ?2, ?3, ?4)",
            params![chain_id, def.chain.name, def.chain.description, def.chain.enabled],
        )
        .map_err(db)?;

        for step in &def.steps {
            tx.execute(
                "INSERT INTO chain_steps (chain_id, id, position, key, tool, args, on_failure, timeout_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    chain_id,
                    step.id.0,
                    step.position,
                    step.key,
                    step.call.tool,
                    serde_json::to_string(&step.call.args)?,
                    step.on_failure.map(|p| p.as_str()),
                    step.timeout_secs.map(|t| t as i64),
                ],
            )
            .map_err(db)?;
        }

        for action in &def.actions {
            let (step_id, parent_id) = action.owner.columns();
            let (tool, args, key, timeout, status, message) = match &action.kind {
                ActionKind::Invoke {
                    call,
                    key,
                    timeout_secs,
                } => (
                    Some(call.tool.clone()),
                    Some(serde_json::to_string(&call.args)?),
                    key.clone(),
                    timeout_secs.map(|t| t as i64),
                    None,
                    None,
                ),
                ActionKind::Branch => (None, None, None, None, None, None),
                ActionKind::Terminal { status, message } => {
                    (None, None, None, None, Some(status.as_str()), message.clone())
                }
            };
            tx.execute(
                "INSERT INTO chain_actions (chain_id, id, step_id, parent_action_id, branch, position,
                                            kind, tool, args, key, timeout_secs, terminal_status, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    chain_id,
                    action.id.0,
                    step_id,
                    parent_id,
                    action.branch.as_str(),
                    action.position,
                    action.kind.name(),
                    tool,
                    args,
                    key,
                    timeout,
                    status,
                    message,
                ],
            )
            .map_err(db)?;
        }

        for group in &def.condition_groups {
            let (step_id, action_id) = group.owner.columns();
            tx.execute(
                "INSERT INTO chain_condition_groups (chain_id, id, step_id, action_id, combinator)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chain_id, group.id.0, step_id, action_id, group.combinator.as_str()],
            )
            .map_err(db)?;
        }

        for condition in &def.conditions {
            tx.execute(
                "INSERT INTO chain_conditions (chain_id, id, group_id, path, operator, value, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    chain_id,
                    condition.id.0,
                    condition.group_id.0,
                    condition.path,
                    condition.operator.as_str(),
                    serde_json::to_string(&condition.value)?,
                    condition.position,
                ],
            )
            .map_err(db)?;
        }

        tx.commit().map_err(db)?;
        debug!(chain_id, steps = def.steps.len(), actions = def.actions.len(), "Chain saved");
        Ok(())
    }

    /// Load a chain with all of its rows.
    pub fn chain(&self, id: ChainId) -> Result<ChainDefinition> {
        let conn = self.lock()?;

        let chain = conn
            .query_row(
                "SELECT id, name, description, enabled FROM chains WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(Chain {
                        id: ChainId(row.get(0)?),
                        name: row.get(1)?,
                        description: row.get(2)?,
                        enabled: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(db)?
            .ok_or(HearthError::ChainNotFound(id.0))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, position, key, tool, args, on_failure, timeout_secs
                 FROM chain_steps WHERE chain_id = ?1 ORDER BY position, id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            })
            .map_err(db)?;
        let mut steps = Vec::new();
        for row in rows {
            let (step_id, position, key, tool, args, on_failure, timeout) = row.map_err(db)?;
            steps.push(StepDef {
                id: StepId(step_id),
                position,
                key,
                call: ToolCall::new(tool).with_args(serde_json::from_str(&args)?),
                on_failure: on_failure.as_deref().map(str::parse).transpose()?,
                timeout_secs: timeout.map(|t| t as u64),
            });
        }

        let mut stmt = conn
            .prepare(
                "SELECT id, step_id, parent_action_id, branch, position, kind, tool, args, key,
                        timeout_secs, terminal_status, message
                 FROM chain_actions WHERE chain_id = ?1 ORDER BY id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok(ActionRow {
                    id: row.get(0)?,
                    step_id: row.get(1)?,
                    parent_action_id: row.get(2)?,
                    branch: row.get(3)?,
                    position: row.get(4)?,
                    kind: row.get(5)?,
                    tool: row.get(6)?,
                    args: row.get(7)?,
                    key: row.get(8)?,
                    timeout_secs: row.get(9)?,
                    terminal_status: row.get(10)?,
                    message: row.get(11)?,
                })
            })
            .map_err(db)?;
        let mut actions = Vec::new();
        for row in rows {
            actions.push(row.map_err(db)?.into_action()?);
        }

        let mut stmt = conn
            .prepare(
                "SELECT id, step_id, action_id, combinator
                 FROM chain_condition_groups WHERE chain_id = ?1 ORDER BY id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db)?;
        let mut condition_groups = Vec::new();
        for row in rows {
            let (group_id, step_id, action_id, combinator) = row.map_err(db)?;
            condition_groups.push(ConditionGroupDef {
                id: GroupId(group_id),
                owner: Owner::from_columns(step_id, action_id)?,
                combinator: combinator.parse()?,
            });
        }

        let mut stmt = conn
            .prepare(
                "SELECT id, group_id, path, operator, value, position
                 FROM chain_conditions WHERE chain_id = ?1 ORDER BY group_id, position, id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(db)?;
        let mut conditions = Vec::new();
        for row in rows {
            let (condition_id, group_id, path, operator, value, position) = row.map_err(db)?;
            conditions.push(ConditionDef {
                id: ConditionId(condition_id),
                group_id: GroupId(group_id),
                path,
                operator: operator.parse()?,
                value: serde_json::from_str(&value)?,
                position,
            });
        }

        Ok(ChainDefinition {
            chain,
            steps,
            actions,
            condition_groups,
            conditions,
        })
    }

    /// All stored chains, ordered by id.
    pub fn chains(&self) -> Result<Vec<Chain>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, description, enabled FROM chains ORDER BY id")
            .map_err(db)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Chain {
                    id: ChainId(row.get(0)?),
                    name: row.get(1)?,
                    description: row.get(2)?,
                    enabled: row.get(3)?,
                })
            })
            .map_err(db)?;
        let chains = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)?;
        Ok(chains)
    }

    /// Delete a chain and all of its rows. Returns whether it existed.
    /// Execution records are kept.
    pub fn delete_chain(&self, id: ChainId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let mut existed = false;
        for table in CHAIN_TABLES {
            let column = if table == "chains" { "id" } else { "chain_id" };
            let n = tx
                .execute(
                    &format!("DELETE FROM {} WHERE {} = ?1", table, column),
                    params![id.0],
                )
                .map_err(db)?;
            if table == "chains" {
                existed = n > 0;
            }
        }
        tx.commit().map_err(db)?;
        Ok(existed)
    }

    /// Store a sealed record.
    pub fn save_record(&self, record: &ExecutionRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO execution_records
                (run_id, chain_id, status, caller, started_at, finished_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.run_id.0,
                record.chain_id.0,
                record.status.as_str(),
                record.caller,
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
                json,
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    /// Most recent records of a chain, newest first.
    pub fn records_for(&self, chain_id: ChainId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT record FROM execution_records
                 WHERE chain_id = ?1
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT ?2",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![chain_id.0, limit as i64], |row| row.get::<_, String>(0))
            .map_err(db)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row.map_err(db)?)?);
        }
        Ok(records)
    }
}

struct ActionRow {
    id: i64,
    step_id: Option<i64>,
    parent_action_id: Option<i64>,
    branch: String,
    position: i64,
    kind: String,
    tool: Option<String>,
    args: Option<String>,
    key: Option<String>,
    timeout_secs: Option<i64>,
    terminal_status: Option<String>,
    message: Option<String>,
}

impl ActionRow {
    fn into_action(self) -> Result<ActionDef> {
        let kind = match self.kind.as_str() {
            "invoke" => {
                let tool = self.tool.ok_or_else(|| {
                    HearthError::InvalidChain(format!("invoke action {} has no tool", self.id))
                })?;
                let args = match self.args {
                    Some(args) => serde_json::from_str(&args)?,
                    None => serde_json::json!({}),
                };
                ActionKind::Invoke {
                    call: ToolCall::new(tool).with_args(args),
                    key: self.key,
                    timeout_secs: self.timeout_secs.map(|t| t as u64),
                }
            }
            "branch" => ActionKind::Branch,
            "terminal" => ActionKind::Terminal {
                status: self
                    .terminal_status
                    .as_deref()
                    .ok_or_else(|| {
                        HearthError::InvalidChain(format!(
                            "terminal action {} has no status",
                            self.id
                        ))
                    })?
                    .parse()?,
                message: self.message,
            },
            other => {
                return Err(HearthError::InvalidChain(format!(
                    "action {} has unknown kind '{}'",
                    self.id, other
                )))
            }
        };
        Ok(ActionDef {
            id: ActionId(self.id),
            owner: Owner::from_columns(self.step_id, self.parent_action_id)?,
            branch: self.branch.parse()?,
            position: self.position,
            kind,
        })
    }
}

impl ChainSource for SqliteStore {
    fn load_chain(&self, id: ChainId) -> BoxFuture<'_, Result<ChainDefinition>> {
        Box::pin(async move { self.chain(id) })
    }

    fn list_chains(&self) -> BoxFuture<'_, Result<Vec<Chain>>> {
        Box::pin(async move { self.chains() })
    }
}

impl RecordSink for SqliteStore {
    fn append<'a>(&'a self, record: &'a ExecutionRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.save_record(record) })
    }
}
