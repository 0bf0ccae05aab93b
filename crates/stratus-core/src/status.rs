//! Indexing status state machine and the single-writer gate.
//!
//! ```text
//! QUEUE ──▶ PROCESSING ──▶ SUCCESS
//!                     └──▶ FAILED
//! ```
//!
//! Terminal rows are never reused; a new indexing request creates a new
//! `QUEUE` row.

use crate::error::{StratusError, StratusResult};
use crate::models::{IndexState, ProjectStatus};
use crate::repository::ProjectRepository;

pub fn can_transition(from: IndexState, to: IndexState) -> bool {
    matches!(
        (from, to),
        (IndexState::Queue, IndexState::Processing)
            | (IndexState::Processing, IndexState::Success)
            | (IndexState::Processing, IndexState::Failed)
    )
}

/// Apply a transition through the repository's compare-and-set.
///
/// Returns `InvalidTransition` for edges outside the state machine and
/// `Conflict` if the row was not in `from` when the write happened.
pub async fn transition(
    repo: &dyn ProjectRepository,
    status: &ProjectStatus,
    to: IndexState,
    message: Option<&str>,
) -> StratusResult<()> {
    if !can_transition(status.state, to) {
        return Err(StratusError::InvalidTransition {
            from: status.state,
            to,
        });
    }
    if repo
        .compare_and_set(&status.id, status.state, to, message)
        .await?
    {
        Ok(())
    } else {
        Err(StratusError::Conflict(format!(
            "status {} is no longer {}",
            status.id, status.state
        )))
    }
}

/// Claim the right to index a project.
///
/// Finds or creates the project's `QUEUE` row and moves it to
/// `PROCESSING`. If a run is already in progress, or another caller wins
/// the race for the same row, the claim fails with `Conflict`. On success
/// the returned row is in `PROCESSING` and the caller owns it until it
/// moves it to a terminal state.
pub async fn claim_for_indexing(
    repo: &dyn ProjectRepository,
    project_id: &str,
) -> StratusResult<ProjectStatus> {
    if repo.get_project(project_id).await?.is_none() {
        return Err(StratusError::project_not_found(project_id));
    }

    let mut status = repo.enqueue(project_id).await?;
    if status.state == IndexState::Processing {
        return Err(StratusError::Conflict(format!(
            "project {project_id} is already being indexed"
        )));
    }

    transition(repo, &status, IndexState::Processing, None)
        .await
        .map_err(|e| match e {
            StratusError::Conflict(_) => StratusError::Conflict(format!(
                "project {project_id} was claimed by another indexing request"
            )),
            other => other,
        })?;
    status.state = IndexState::Processing;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Project;
    use crate::repository::InMemoryRepository;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn repo_with_project() -> InMemoryRepository {
        let repo = InMemoryRepository::new();
        repo.insert_project(Project {
            id: "p1".into(),
            name: "demo".into(),
            path: PathBuf::from("/tmp/demo"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .unwrap();
        repo
    }

    #[test]
    fn test_transition_table() {
        use IndexState::*;
        assert!(can_transition(Queue, Processing));
        assert!(can_transition(Processing, Success));
        assert!(can_transition(Processing, Failed));
        assert!(!can_transition(Queue, Success));
        assert!(!can_transition(Success, Processing));
        assert!(!can_transition(Failed, Queue));
    }

    #[tokio::test]
    async fn test_claim_then_second_claim_conflicts() {
        let repo = repo_with_project();
        let status = claim_for_indexing(&repo, "p1").await.unwrap();
        assert_eq!(status.state, IndexState::Processing);

        let err = claim_for_indexing(&repo, "p1").await.unwrap_err();
        assert!(matches!(err, StratusError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminal_row_allows_new_claim() {
        let repo = repo_with_project();
        let first = claim_for_indexing(&repo, "p1").await.unwrap();
        transition(&repo, &first, IndexState::Success, None)
            .await
            .unwrap();

        let second = claim_for_indexing(&repo, "p1").await.unwrap();
        assert_ne!(first.id, second.id);
        let latest = repo.latest_status("p1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_unknown_project_not_found() {
        let repo = repo_with_project();
        let err = claim_for_indexing(&repo, "missing").await.unwrap_err();
        assert!(matches!(err, StratusError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let repo = repo_with_project();
        let status = repo.enqueue("p1").await.unwrap();
        let err = transition(&repo, &status, IndexState::Success, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let repo = Arc::new(repo_with_project());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                claim_for_indexing(repo.as_ref(), "p1").await.is_ok()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
