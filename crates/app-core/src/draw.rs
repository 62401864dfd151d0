//! Group draw orchestration
//!
//! [`DrawService::perform_draw`] runs the one-time draw for a group:
//!
//! 1. fetch the confirmed participants (at least two are required),
//! 2. build their restriction map,
//! 3. refuse if the group already has assignments,
//! 4. generate a valid assignment,
//! 5. persist the whole set in one atomic write.
//!
//! Only step 5 mutates anything, so a failed draw leaves the group exactly as
//! it was. Step 3 alone cannot stop two concurrent callers from both passing
//! the check; the store must reject the second write, and a rejected write is
//! reported as [`DrawError::AlreadyDrawn`].
//!
//! A caller that wraps a draw in a timeout and hits it does not know whether
//! the write landed. Check [`DrawService::draw_status`] before trying again.
//!
//! # Example
//!
//! ```rust,no_run
//! use app_core::draw::{DrawConfig, DrawService};
//! use storage::{DatabaseConfig, GroupStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = GroupStore::open(DatabaseConfig::new("amigo.db")).await?;
//!     let service = DrawService::new(Arc::new(store), DrawConfig::default());
//!
//!     let report = service.perform_draw("group-id").await?;
//!     println!("Drew {} participants", report.participant_count);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::assignment::{generate_assignments, Assignment, GenerateError, DEFAULT_MAX_ATTEMPTS};
use crate::restrictions::{ParticipantRecord, RestrictionMap};
use storage::{AssignmentPair, DatabaseError, GroupStore};

/// Errors reported by a draw store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The write collided with an existing assignment set
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other storage failure
    #[error("Storage error: {0}")]
    Backend(String),
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Conflict(msg) => StoreError::Conflict(msg),
            e => StoreError::Backend(e.to_string()),
        }
    }
}

/// Storage operations the draw depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DrawStore: Send + Sync {
    /// Participants of the group whose confirmation marker is set
    async fn fetch_confirmed_participants(
        &self,
        group_id: &str,
    ) -> std::result::Result<Vec<ParticipantRecord>, StoreError>;

    /// Whether the group already has any assignment
    async fn assignments_exist(&self, group_id: &str) -> std::result::Result<bool, StoreError>;

    /// Write the complete assignment set; must apply fully or not at all
    async fn persist_assignments(
        &self,
        group_id: &str,
        assignments: &[Assignment],
    ) -> std::result::Result<(), StoreError>;
}

#[async_trait]
impl DrawStore for GroupStore {
    async fn fetch_confirmed_participants(
        &self,
        group_id: &str,
    ) -> std::result::Result<Vec<ParticipantRecord>, StoreError> {
        let rows = self.confirmed_participants(group_id).await?;
        Ok(rows
            .into_iter()
            .map(|row| ParticipantRecord {
                participant_id: row.user_id,
                restrictions: row.restrictions,
            })
            .collect())
    }

    async fn assignments_exist(&self, group_id: &str) -> std::result::Result<bool, StoreError> {
        Ok(self.has_assignments(group_id).await?)
    }

    async fn persist_assignments(
        &self,
        group_id: &str,
        assignments: &[Assignment],
    ) -> std::result::Result<(), StoreError> {
        let pairs: Vec<AssignmentPair> = assignments
            .iter()
            .map(|a| AssignmentPair {
                giver_id: a.giver_id.clone(),
                receiver_id: a.receiver_id.clone(),
            })
            .collect();

        self.insert_assignments(group_id, &pairs).await?;
        Ok(())
    }
}

/// Draw failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DrawError {
    /// Fewer than two confirmed participants
    #[error("At least 2 confirmed participants are required for the draw, found {found}")]
    InsufficientParticipants {
        /// Confirmed participants found
        found: usize,
    },

    /// The group has already been drawn
    #[error("Draw has already been performed for this group")]
    AlreadyDrawn,

    /// No valid assignment found within the attempt budget
    #[error("Unable to generate valid assignments after {attempts} attempts, please review restrictions")]
    UnsatisfiableConstraints {
        /// Attempts made
        attempts: u32,
        /// True when the restrictions admit no valid assignment at all
        proven_infeasible: bool,
    },

    /// The store failed
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl DrawError {
    /// Stable machine-readable reason code
    pub fn reason(&self) -> &'static str {
        match self {
            DrawError::InsufficientParticipants { .. } => "insufficient-participants",
            DrawError::AlreadyDrawn => "already-drawn",
            DrawError::UnsatisfiableConstraints { .. } => "unsatisfiable-constraints",
            DrawError::Persistence(_) => "persistence-error",
        }
    }
}

impl From<StoreError> for DrawError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => DrawError::AlreadyDrawn,
            StoreError::Backend(msg) => DrawError::Persistence(msg),
        }
    }
}

impl From<GenerateError> for DrawError {
    fn from(err: GenerateError) -> Self {
        match err {
            GenerateError::TooFewParticipants(found) => DrawError::InsufficientParticipants { found },
            GenerateError::Unsatisfiable {
                attempts,
                proven_infeasible,
            } => DrawError::UnsatisfiableConstraints {
                attempts,
                proven_infeasible,
            },
        }
    }
}

/// Result type for draw operations
pub type Result<T> = std::result::Result<T, DrawError>;

/// Draw configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawConfig {
    /// Shuffles tried before reporting unsatisfiable constraints
    pub max_attempts: u32,

    /// Fixed RNG seed; `None` seeds from OS entropy
    pub seed: Option<u64>,
}

impl Default for DrawConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            seed: None,
        }
    }
}

impl DrawConfig {
    /// Set the attempt budget
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Use a fixed RNG seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Draw status of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrawStatus {
    /// No assignments yet
    NotDrawn,

    /// Assignments exist; terminal
    Drawn,
}

/// Summary of a completed draw
///
/// Deliberately carries no pairings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawReport {
    /// Group that was drawn
    pub group_id: String,

    /// Participants included
    pub participant_count: usize,

    /// Attempt on which a valid assignment was found
    pub attempts: u32,
}

/// Runs group draws against a [`DrawStore`]
pub struct DrawService {
    store: Arc<dyn DrawStore>,
    config: DrawConfig,
}

impl DrawService {
    /// Create a new draw service
    pub fn new(store: Arc<dyn DrawStore>, config: DrawConfig) -> Self {
        Self { store, config }
    }

    /// Get the configuration
    pub fn config(&self) -> &DrawConfig {
        &self.config
    }

    /// Report whether the group has been drawn
    pub async fn draw_status(&self, group_id: &str) -> Result<DrawStatus> {
        if self.store.assignments_exist(group_id).await? {
            Ok(DrawStatus::Drawn)
        } else {
            Ok(DrawStatus::NotDrawn)
        }
    }

    /// Perform the draw for a group
    pub async fn perform_draw(&self, group_id: &str) -> Result<DrawReport> {
        let result = self.run_draw(group_id).await;
        match &result {
            Ok(report) => tracing::info!(
                group_id,
                participants = report.participant_count,
                attempts = report.attempts,
                "Draw completed"
            ),
            Err(e) => tracing::warn!(group_id, reason = e.reason(), "Draw failed: {}", e),
        }
        result
    }

    async fn run_draw(&self, group_id: &str) -> Result<DrawReport> {
        let participants = self.store.fetch_confirmed_participants(group_id).await?;
        if participants.len() < 2 {
            return Err(DrawError::InsufficientParticipants {
                found: participants.len(),
            });
        }

        let restrictions = RestrictionMap::from_participants(&participants);

        if self.store.assignments_exist(group_id).await? {
            return Err(DrawError::AlreadyDrawn);
        }

        let ids: Vec<String> = participants
            .iter()
            .map(|p| p.participant_id.clone())
            .collect();

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let generated =
            generate_assignments(&ids, &restrictions, self.config.max_attempts, &mut rng)?;

        self.store
            .persist_assignments(group_id, &generated.assignments)
            .await?;

        Ok(DrawReport {
            group_id: group_id.to_string(),
            participant_count: ids.len(),
            attempts: generated.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn participants(names: &[&str]) -> Vec<ParticipantRecord> {
        names.iter().map(|n| ParticipantRecord::new(*n)).collect()
    }

    fn service(store: MockDrawStore) -> DrawService {
        DrawService::new(Arc::new(store), DrawConfig::default().seed(11))
    }

    #[tokio::test]
    async fn test_successful_draw_persists_full_set() {
        let written: Arc<Mutex<Vec<Assignment>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();

        let mut store = MockDrawStore::new();
        store
            .expect_fetch_confirmed_participants()
            .times(1)
            .returning(|_| Ok(participants(&["ana", "beto", "carla", "dani"])));
        store
            .expect_assignments_exist()
            .times(1)
            .returning(|_| Ok(false));
        store
            .expect_persist_assignments()
            .times(1)
            .returning(move |_, assignments| {
                sink.lock().unwrap().extend(assignments.iter().cloned());
                Ok(())
            });

        let report = service(store).perform_draw("g1").await.unwrap();
        assert_eq!(report.group_id, "g1");
        assert_eq!(report.participant_count, 4);
        assert!(report.attempts >= 1);

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 4);
        let receivers: HashSet<_> = written.iter().map(|a| a.receiver_id.as_str()).collect();
        assert_eq!(receivers.len(), 4);
        assert!(written.iter().all(|a| a.giver_id != a.receiver_id));
    }

    #[tokio::test]
    async fn test_insufficient_participants() {
        let mut store = MockDrawStore::new();
        store
            .expect_fetch_confirmed_participants()
            .returning(|_| Ok(participants(&["ana"])));
        store.expect_assignments_exist().never();
        store.expect_persist_assignments().never();

        let err = service(store).perform_draw("g1").await.unwrap_err();
        assert_eq!(err, DrawError::InsufficientParticipants { found: 1 });
        assert_eq!(err.reason(), "insufficient-participants");
    }

    #[tokio::test]
    async fn test_no_participants() {
        let mut store = MockDrawStore::new();
        store
            .expect_fetch_confirmed_participants()
            .returning(|_| Ok(Vec::new()));
        store.expect_persist_assignments().never();

        let err = service(store).perform_draw("g1").await.unwrap_err();
        assert_eq!(err, DrawError::InsufficientParticipants { found: 0 });
    }

    #[tokio::test]
    async fn test_already_drawn_is_not_overwritten() {
        let mut store = MockDrawStore::new();
        store
            .expect_fetch_confirmed_participants()
            .returning(|_| Ok(participants(&["ana", "beto"])));
        store.expect_assignments_exist().returning(|_| Ok(true));
        store.expect_persist_assignments().never();

        let err = service(store).perform_draw("g1").await.unwrap_err();
        assert_eq!(err, DrawError::AlreadyDrawn);
        assert_eq!(err.reason(), "already-drawn");
    }

    #[tokio::test]
    async fn test_unsatisfiable_restrictions() {
        let mut store = MockDrawStore::new();
        store.expect_fetch_confirmed_participants().returning(|_| {
            Ok(vec![
                ParticipantRecord::new("a").with_restrictions(json!(["b", "c"])),
                ParticipantRecord::new("b").with_restrictions(json!(["a", "c"])),
                ParticipantRecord::new("c").with_restrictions(json!(["a", "b"])),
            ])
        });
        store.expect_assignments_exist().returning(|_| Ok(false));
        store.expect_persist_assignments().never();

        let err = service(store).perform_draw("g1").await.unwrap_err();
        assert_eq!(
            err,
            DrawError::UnsatisfiableConstraints {
                attempts: DEFAULT_MAX_ATTEMPTS,
                proven_infeasible: true,
            }
        );
        assert_eq!(err.reason(), "unsatisfiable-constraints");
    }

    #[tokio::test]
    async fn test_attempt_budget_comes_from_config() {
        let mut store = MockDrawStore::new();
        store
            .expect_fetch_confirmed_participants()
            .returning(|_| Ok(participants(&["a", "b", "c"])));
        store.expect_assignments_exist().returning(|_| Ok(false));
        store.expect_persist_assignments().never();

        let service = DrawService::new(Arc::new(store), DrawConfig::default().max_attempts(0));
        let err = service.perform_draw("g1").await.unwrap_err();
        assert_eq!(
            err,
            DrawError::UnsatisfiableConstraints {
                attempts: 0,
                proven_infeasible: false,
            }
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported() {
        let mut store = MockDrawStore::new();
        store
            .expect_fetch_confirmed_participants()
            .returning(|_| Ok(participants(&["ana", "beto", "carla"])));
        store.expect_assignments_exist().returning(|_| Ok(false));
        store
            .expect_persist_assignments()
            .times(1)
            .returning(|_, _| Err(StoreError::Backend("disk full".to_string())));

        let err = service(store).perform_draw("g1").await.unwrap_err();
        assert_eq!(err, DrawError::Persistence("disk full".to_string()));
        assert_eq!(err.reason(), "persistence-error");
    }

    #[tokio::test]
    async fn test_lost_race_reports_already_drawn() {
        let mut store = MockDrawStore::new();
        store
            .expect_fetch_confirmed_participants()
            .returning(|_| Ok(participants(&["ana", "beto"])));
        store.expect_assignments_exist().returning(|_| Ok(false));
        store
            .expect_persist_assignments()
            .returning(|_, _| Err(StoreError::Conflict("UNIQUE constraint failed".to_string())));

        let err = service(store).perform_draw("g1").await.unwrap_err();
        assert_eq!(err, DrawError::AlreadyDrawn);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_persistence_error() {
        let mut store = MockDrawStore::new();
        store
            .expect_fetch_confirmed_participants()
            .returning(|_| Err(StoreError::Backend("offline".to_string())));
        store.expect_assignments_exist().never();

        let err = service(store).perform_draw("g1").await.unwrap_err();
        assert_eq!(err.reason(), "persistence-error");
    }

    #[tokio::test]
    async fn test_draw_status() {
        let mut store = MockDrawStore::new();
        let mut answers = vec![false, true].into_iter();
        store
            .expect_assignments_exist()
            .times(2)
            .returning(move |_| Ok(answers.next().unwrap_or(false)));

        let service = service(store);
        assert_eq!(service.draw_status("g1").await.unwrap(), DrawStatus::NotDrawn);
        assert_eq!(service.draw_status("g1").await.unwrap(), DrawStatus::Drawn);
    }

    #[tokio::test]
    async fn test_draw_against_group_store() {
        let store = Arc::new(GroupStore::in_memory().await.unwrap());
        let group = store.create_group("Navidad", None, "ana").await.unwrap();
        for user in ["beto", "carla"] {
            store.add_participant(&group.id, user).await.unwrap();
        }
        for user in ["ana", "beto", "carla"] {
            store.confirm_participant(&group.id, user).await.unwrap();
        }
        store
            .set_restrictions(&group.id, "ana", &["beto".to_string()])
            .await
            .unwrap();

        let service = DrawService::new(store.clone(), DrawConfig::default());
        let report = service.perform_draw(&group.id).await.unwrap();
        assert_eq!(report.participant_count, 3);
        assert_eq!(service.draw_status(&group.id).await.unwrap(), DrawStatus::Drawn);

        let rows = store.list_assignments(&group.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        let ana = rows.iter().find(|r| r.giver_id == "ana").unwrap();
        assert_eq!(ana.receiver_id, "carla");

        let err = service.perform_draw(&group.id).await.unwrap_err();
        assert_eq!(err, DrawError::AlreadyDrawn);
        assert_eq!(store.list_assignments(&group.id).await.unwrap(), rows);
    }

    #[tokio::test]
    async fn test_malformed_restrictions_do_not_block_draw() {
        let store = Arc::new(GroupStore::in_memory().await.unwrap());
        let group = store.create_group("Oficina", None, "ana").await.unwrap();
        store.add_participant(&group.id, "beto").await.unwrap();
        store.confirm_participant(&group.id, "ana").await.unwrap();
        store.confirm_participant(&group.id, "beto").await.unwrap();
        store
            .database()
            .execute("UPDATE participants SET restrictions = '{\"beto\": true}' WHERE user_id = 'ana'")
            .await
            .unwrap();
        store
            .database()
            .execute("UPDATE participants SET restrictions = 'null' WHERE user_id = 'beto'")
            .await
            .unwrap();

        let service = DrawService::new(store.clone(), DrawConfig::default());
        service.perform_draw(&group.id).await.unwrap();

        let ana = store.find_assignment(&group.id, "ana").await.unwrap().unwrap();
        assert_eq!(ana.receiver_id, "beto");
    }

    #[test]
    fn test_store_error_mapping() {
        let conflict: StoreError = DatabaseError::Conflict("dup".to_string()).into();
        assert_eq!(conflict, StoreError::Conflict("dup".to_string()));

        let other: StoreError = DatabaseError::NotFound("x".to_string()).into();
        assert!(matches!(other, StoreError::Backend(_)));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: DrawConfig = serde_json::from_str(r#"{"seed": 5}"#).unwrap();
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.seed, Some(5));
    }
}
