use std::fmt;
use std::sync::Arc;

use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};

use crate::db::{Context, Executor};
use crate::errors::ShardError;

/// Function body of an update. Receives the shard-bound context.
pub type UpdateFn = Arc<dyn Fn(&mut Context) -> anyhow::Result<()> + Send + Sync>;

/// A named, idempotent unit of schema or data work.
///
/// Specs are immutable and shared by every shard worker; the per-shard
/// mutable state lives in the [`UpdateInstance`] built for each run.
#[derive(Clone)]
pub struct UpdateSpec {
    name: String,
    description: String,
    run: UpdateFn,
}

impl fmt::Debug for UpdateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl UpdateSpec {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            run: Arc::new(run),
        }
    }

    /// An update whose body is a single SQL script.
    pub fn sql(name: impl Into<String>, description: impl Into<String>, script: &'static str) -> Self {
        Self::new(name, description, move |ctx| {
            ctx.execute_batch(script)?;
            Ok(())
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Fresh per-shard instance in the `Pending` state.
    pub fn instance(&self) -> UpdateInstance<'_> {
        UpdateInstance {
            spec: self,
            state: UpdateState::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Pending,
    Running,
    Complete,
    Skipped,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One update being applied to one shard.
#[derive(Debug)]
pub struct UpdateInstance<'a> {
    spec: &'a UpdateSpec,
    state: UpdateState,
}

impl UpdateInstance<'_> {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// True unless this shard already carries a completion marker for the update.
    pub fn needs_to_run(&self, ctx: &impl Executor) -> Result<bool, ShardError> {
        Ok(fetch_db_update_by_name(ctx, &self.spec.name)?.is_none())
    }

    /// Execute the update body. Does not write the completion marker.
    pub fn run(&mut self, ctx: &mut Context) -> Result<(), ShardError> {
        self.state = UpdateState::Running;
        (self.spec.run)(ctx).map_err(|source| {
            self.state = UpdateState::Failed;
            ShardError::UpdateFailed {
                update: self.spec.name.clone(),
                source,
            }
        })
    }

    /// Persist the completion marker (upsert by name).
    pub fn set_complete(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        let mut marker = create_db_update_by_name(ctx, &self.spec.name)?;
        if marker.description.is_empty() {
            marker.description = self.spec.description.clone();
        }
        marker.save(ctx)?;
        self.state = UpdateState::Complete;
        Ok(())
    }

    /// Check, run and mark complete, as one savepoint.
    ///
    /// Returns `Skipped` when the marker already exists. On failure neither
    /// the update's changes nor a marker remain, and the error always names
    /// the update.
    pub fn apply(&mut self, ctx: &mut Context) -> Result<UpdateState, ShardError> {
        let name = self.spec.name.clone();
        let needs = self.needs_to_run(&*ctx).map_err(|e| tag(&name, e))?;
        if !needs {
            self.state = UpdateState::Skipped;
            tracing::debug!(shard = ctx.shard(), update = %name, "already applied");
            return Ok(self.state);
        }

        let result = ctx.savepoint(|ctx| {
            self.run(ctx)?;
            self.set_complete(&*ctx)
        });
        match result {
            Ok(()) => Ok(self.state),
            Err(e) => {
                self.state = UpdateState::Failed;
                Err(tag(&name, e))
            }
        }
    }
}

fn tag(update: &str, err: ShardError) -> ShardError {
    match err {
        ShardError::UpdateFailed { .. } => err,
        other => ShardError::UpdateFailed {
            update: update.to_string(),
            source: anyhow::Error::new(other),
        },
    }
}

/// Completion marker row in `system_db_updates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbUpdate {
    pub id: i64,
    pub update_name: String,
    pub description: String,
    pub created_at: String,
}

const DB_UPDATE_COLUMNS: &str = "id, update_name, description, created_at";

impl DbUpdate {
    pub fn new(update_name: &str) -> Self {
        Self {
            id: 0,
            update_name: update_name.to_string(),
            description: String::new(),
            created_at: String::new(),
        }
    }

    pub fn is_saved(&self) -> bool {
        self.id > 0
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            update_name: row.get(1)?,
            description: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    /// Insert, or update the description of the row with the same name.
    pub fn save(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        ctx.execute(
            "INSERT INTO system_db_updates (update_name, description) VALUES (?1, ?2)
             ON CONFLICT(update_name) DO UPDATE SET description = excluded.description",
            params![self.update_name, self.description],
        )?;
        let fresh = fetch_db_update_by_name(ctx, &self.update_name)?.ok_or_else(|| {
            ShardError::Other(anyhow::anyhow!(
                "marker {} vanished on shard {}",
                self.update_name,
                ctx.shard()
            ))
        })?;
        *self = fresh;
        Ok(())
    }

    /// Remove the marker so the update runs again on the next pass.
    pub fn delete(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        ctx.execute(
            "DELETE FROM system_db_updates WHERE update_name = ?1",
            params![self.update_name],
        )?;
        self.id = 0;
        Ok(())
    }
}

pub fn fetch_db_update_by_name(
    ctx: &impl Executor,
    name: &str,
) -> Result<Option<DbUpdate>, ShardError> {
    let sql = format!("SELECT {DB_UPDATE_COLUMNS} FROM system_db_updates WHERE update_name = ?1");
    ctx.query_opt(&sql, params![name], DbUpdate::from_row)
}

/// Existing marker for `name`, or an unsaved one.
pub fn create_db_update_by_name(ctx: &impl Executor, name: &str) -> Result<DbUpdate, ShardError> {
    Ok(fetch_db_update_by_name(ctx, name)?.unwrap_or_else(|| DbUpdate::new(name)))
}

/// Every marker on the shard, oldest first.
pub fn list_db_updates(ctx: &impl Executor) -> Result<Vec<DbUpdate>, ShardError> {
    let sql = format!("SELECT {DB_UPDATE_COLUMNS} FROM system_db_updates ORDER BY id");
    ctx.query(&sql, params![], DbUpdate::from_row)
}
