//! Project and status persistence abstraction.
//!
//! The indexing gate only needs three things from storage: look up a
//! project, find or create the project's active status row, and
//! atomically move a status row from one state to another.
//! [`InMemoryRepository`] backs unit tests; the app crate provides the
//! SQLite implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{IndexState, Project, ProjectStatus};

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn get_project(&self, id: &str) -> Result<Option<Project>>;

    /// Most recently created status row of a project.
    async fn latest_status(&self, project_id: &str) -> Result<Option<ProjectStatus>>;

    /// Return the project's active (`queue` or `processing`) status row,
    /// creating a `queue` row if there is none.
    ///
    /// At most one active row exists per project at any time.
    async fn enqueue(&self, project_id: &str) -> Result<ProjectStatus>;

    /// Move `status_id` from `from` to `to` if and only if it is currently
    /// in `from`. Returns whether the transition happened.
    async fn compare_and_set(
        &self,
        status_id: &str,
        from: IndexState,
        to: IndexState,
        message: Option<&str>,
    ) -> Result<bool>;
}

fn is_active(state: IndexState) -> bool {
    matches!(state, IndexState::Queue | IndexState::Processing)
}

#[derive(Default)]
struct Tables {
    projects: HashMap<String, Project>,
    statuses: Vec<ProjectStatus>,
}

/// Mutex-guarded repository for tests.
#[derive(Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: Project) -> Result<()> {
        let mut tables = self.lock()?;
        tables.projects.insert(project.id.clone(), project);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("repository lock poisoned"))
    }
}

#[async_trait]
impl ProjectRepository for InMemoryRepository {
    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.lock()?.projects.get(id).cloned())
    }

    async fn latest_status(&self, project_id: &str) -> Result<Option<ProjectStatus>> {
        Ok(self
            .lock()?
            .statuses
            .iter()
            .rev()
            .find(|s| s.project_id == project_id)
            .cloned())
    }

    async fn enqueue(&self, project_id: &str) -> Result<ProjectStatus> {
        let mut tables = self.lock()?;
        if let Some(active) = tables
            .statuses
            .iter()
            .find(|s| s.project_id == project_id && is_active(s.state))
        {
            return Ok(active.clone());
        }
        let now = Utc::now();
        let status = ProjectStatus {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            state: IndexState::Queue,
            message: None,
            created_at: now,
            updated_at: now,
        };
        tables.statuses.push(status.clone());
        Ok(status)
    }

    async fn compare_and_set(
        &self,
        status_id: &str,
        from: IndexState,
        to: IndexState,
        message: Option<&str>,
    ) -> Result<bool> {
        let mut tables = self.lock()?;
        match tables
            .statuses
            .iter_mut()
            .find(|s| s.id == status_id && s.state == from)
        {
            Some(status) => {
                status.state = to;
                status.message = message.map(str::to_string);
                status.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
