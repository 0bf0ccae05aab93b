//! Project registry and status persistence on SQLite.
//!
//! [`SqliteProjectRepository`] implements the core
//! [`ProjectRepository`] contract used by the indexing gate, plus the
//! CRUD operations behind the `stratus project` commands.
//!
//! The "at most one active status per project" invariant is enforced by
//! the partial unique index `idx_project_status_active`; state changes go
//! through a single conditional `UPDATE`, so concurrent claimers can never
//! both observe success.

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use stratus_core::models::{IndexState, Project, ProjectStatus};
use stratus_core::repository::ProjectRepository;
use stratus_core::{StratusError, StratusResult};

const MAX_NAME_LEN: usize = 64;

pub struct SqliteProjectRepository {
    pool: SqlitePool,
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn project_from_row(row: &SqliteRow) -> Project {
    let path: String = row.get("path");
    Project {
        id: row.get("id"),
        name: row.get("name"),
        path: path.into(),
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    }
}

fn status_from_row(row: &SqliteRow) -> Result<ProjectStatus> {
    let state: String = row.get("state");
    Ok(ProjectStatus {
        id: row.get("id"),
        project_id: row.get("project_id"),
        state: state.parse().map_err(anyhow::Error::msg)?,
        message: row.get("message"),
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    })
}

/// Collection keys must be portable identifiers.
pub fn validate_project_name(name: &str) -> StratusResult<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if ok {
        Ok(())
    } else {
        Err(StratusError::Invalid(format!(
            "project name `{name}` must be 1-{MAX_NAME_LEN} characters of [A-Za-z0-9._-] starting with a letter or digit"
        )))
    }
}

impl SqliteProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a project and queue its first indexing run.
    pub async fn create_project(&self, name: &str, path: &Path) -> StratusResult<Project> {
        validate_project_name(name)?;
        let path = path.canonicalize().map_err(|e| {
            StratusError::Invalid(format!("project path {}: {e}", path.display()))
        })?;
        if !path.is_dir() {
            return Err(StratusError::Invalid(format!(
                "project path {} is not a directory",
                path.display()
            )));
        }

        let now = now_ms();
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            path,
            created_at: from_ms(now),
            updated_at: from_ms(now),
        };

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        let inserted = sqlx::query(
            "INSERT INTO projects (id, name, path, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(project.path.to_string_lossy().as_ref())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StratusError::Conflict(format!(
                    "a project named `{}` or rooted at {} already exists",
                    project.name,
                    project.path.display()
                )));
            }
            Err(e) => return Err(anyhow::Error::from(e).into()),
        }

        sqlx::query(
            "INSERT INTO project_status (id, project_id, state, message, created_at, updated_at) \
             VALUES (?, ?, 'queue', NULL, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&project.id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        tx.commit().await.map_err(anyhow::Error::from)?;
        info!(project = %project.name, id = %project.id, "project registered");
        Ok(project)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(project_from_row).collect())
    }

    /// Look a project up by id or by name.
    pub async fn find_project(&self, key: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ? OR name = ? LIMIT 1")
            .bind(key)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(project_from_row))
    }

    /// Remove a project and its status history.
    ///
    /// Refused while an indexing run holds the project. The processing
    /// check and the delete are one statement, so a claim can never land
    /// between them.
    pub async fn delete_project(&self, id: &str) -> StratusResult<()> {
        let result = sqlx::query(
            "DELETE FROM projects WHERE id = ? AND NOT EXISTS \
             (SELECT 1 FROM project_status WHERE project_id = ? AND state = 'processing')",
        )
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        if self.get_project(id).await?.is_some() {
            Err(StratusError::Conflict(format!("project {id} is being indexed")))
        } else {
            Err(StratusError::project_not_found(id))
        }
    }

    /// Status rows of a project, newest first.
    pub async fn status_history(&self, project_id: &str, limit: i64) -> Result<Vec<ProjectStatus>> {
        let rows = sqlx::query(
            "SELECT * FROM project_status WHERE project_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(status_from_row).collect()
    }

    async fn active_status(&self, project_id: &str) -> Result<Option<ProjectStatus>> {
        let row = sqlx::query(
            "SELECT * FROM project_status \
             WHERE project_id = ? AND state IN ('queue', 'processing') LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(status_from_row).transpose()
    }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(project_from_row))
    }

    async fn latest_status(&self, project_id: &str) -> Result<Option<ProjectStatus>> {
        Ok(self.status_history(project_id, 1).await?.into_iter().next())
    }

    async fn enqueue(&self, project_id: &str) -> Result<ProjectStatus> {
        // The partial unique index makes a lost insert race visible as a
        // unique violation; the winner's row is then read back.
        for _ in 0..3 {
            if let Some(active) = self.active_status(project_id).await? {
                return Ok(active);
            }

            let now = now_ms();
            let status = ProjectStatus {
                id: uuid::Uuid::new_v4().to_string(),
                project_id: project_id.to_string(),
                state: IndexState::Queue,
                message: None,
                created_at: from_ms(now),
                updated_at: from_ms(now),
            };
            let inserted = sqlx::query(
                "INSERT INTO project_status (id, project_id, state, message, created_at, updated_at) \
                 VALUES (?, ?, 'queue', NULL, ?, ?)",
            )
            .bind(&status.id)
            .bind(project_id)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    debug!(project_id, status_id = %status.id, "indexing run queued");
                    return Ok(status);
                }
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("enqueueing project {project_id}"))
                }
            }
        }
        bail!("could not enqueue project {project_id}: active status kept changing")
    }

    async fn compare_and_set(
        &self,
        status_id: &str,
        from: IndexState,
        to: IndexState,
        message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE project_status SET state = ?, message = ?, updated_at = ? \
             WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(message)
        .bind(now_ms())
        .bind(status_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
