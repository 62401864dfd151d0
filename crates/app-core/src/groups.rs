//! Group membership
//!
//! Creating groups, joining, confirming, and editing restrictions. Once a
//! group has been drawn its membership and restrictions are frozen, since
//! the stored assignment set has to keep covering every confirmed
//! participant.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use storage::{DatabaseError, GroupStore, GroupSummary};

/// Minimum group name length, in characters
pub const MIN_GROUP_NAME_LEN: usize = 2;

/// Maximum group name length, in characters
pub const MAX_GROUP_NAME_LEN: usize = 50;

/// Errors that can occur during group operations
#[derive(Debug, Error)]
pub enum GroupError {
    /// Group name failed validation
    #[error("Invalid group name: {0}")]
    InvalidName(String),

    /// A restriction names someone outside the group
    #[error("Invalid restriction: {0} is not a member of this group")]
    InvalidRestriction(String),

    /// A required identifier was empty
    #[error("Missing {0}")]
    MissingField(&'static str),

    /// Group, member or assignment not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// User already belongs to the group
    #[error("User {0} is already a member of this group")]
    AlreadyMember(String),

    /// Group has been drawn and can no longer change
    #[error("Group has already been drawn")]
    AlreadyDrawn,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Result type for group operations
pub type Result<T> = std::result::Result<T, GroupError>;

/// What a giver sees of their own assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentView {
    /// Group ID
    pub group_id: String,

    /// Who the caller gives to
    pub receiver_id: String,

    /// Whether the caller has revealed it
    pub revealed: bool,
}

/// Group membership service
pub struct GroupService {
    store: Arc<GroupStore>,
}

impl GroupService {
    /// Create a new group service
    pub fn new(store: Arc<GroupStore>) -> Self {
        Self { store }
    }

    /// Create a group; the creator joins it automatically
    ///
    /// Returns the new group's ID.
    pub async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
        created_by: &str,
    ) -> Result<String> {
        let name = validate_group_name(name)?;
        require("creator", created_by)?;
        let description = description.map(str::trim).filter(|d| !d.is_empty());

        let group = self.store.create_group(&name, description, created_by).await?;
        tracing::info!(group_id = %group.id, "Group created");
        Ok(group.id)
    }

    /// Add a user to a group
    pub async fn join_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        require("user", user_id)?;

        match self.store.add_participant(group_id, user_id).await {
            Ok(_) => Ok(()),
            Err(DatabaseError::Conflict(_)) => Err(GroupError::AlreadyMember(user_id.to_string())),
            Err(e) => Err(not_found(e)),
        }
    }

    /// Confirm a member's participation in the draw
    pub async fn confirm_participation(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.store
            .confirm_participant(group_id, user_id)
            .await
            .map_err(not_found)
    }

    /// Replace a member's restriction list
    ///
    /// Every entry must be a member of the group. Naming oneself is
    /// accepted and dropped; duplicates collapse.
    pub async fn set_restrictions(
        &self,
        group_id: &str,
        user_id: &str,
        restrictions: &[String],
    ) -> Result<()> {
        let members = self.store.list_participants(group_id).await?;
        if !members.iter().any(|m| m.user_id == user_id) {
            return Err(GroupError::NotFound(format!(
                "participant {} in group {}",
                user_id, group_id
            )));
        }

        let mut cleaned: Vec<String> = Vec::with_capacity(restrictions.len());
        for target in restrictions {
            if !members.iter().any(|m| &m.user_id == target) {
                return Err(GroupError::InvalidRestriction(target.clone()));
            }
            if target != user_id && !cleaned.contains(target) {
                cleaned.push(target.clone());
            }
        }

        self.store
            .set_restrictions(group_id, user_id, &cleaned)
            .await
            .map_err(not_found)
    }

    /// List the groups a user belongs to, newest first
    pub async fn list_groups_for_user(&self, user_id: &str) -> Result<Vec<GroupSummary>> {
        Ok(self.store.list_groups_for_user(user_id).await?)
    }

    /// The caller's own assignment, if the group has been drawn
    pub async fn my_assignment(
        &self,
        group_id: &str,
        giver_id: &str,
    ) -> Result<Option<AssignmentView>> {
        let row = self.store.find_assignment(group_id, giver_id).await?;
        Ok(row.map(|r| AssignmentView {
            group_id: r.group_id,
            receiver_id: r.receiver_id,
            revealed: r.revealed,
        }))
    }

    /// Mark the caller's assignment as revealed and return it
    pub async fn reveal_assignment(&self, group_id: &str, giver_id: &str) -> Result<AssignmentView> {
        self.store
            .mark_revealed(group_id, giver_id)
            .await
            .map_err(not_found)?;

        self.my_assignment(group_id, giver_id)
            .await?
            .ok_or_else(|| GroupError::NotFound(format!("assignment for {}", giver_id)))
    }
}

fn not_found(err: DatabaseError) -> GroupError {
    match err {
        DatabaseError::NotFound(what) => GroupError::NotFound(what),
        DatabaseError::Frozen(_) => GroupError::AlreadyDrawn,
        e => GroupError::Storage(e),
    }
}

fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(GroupError::MissingField(field));
    }
    Ok(())
}

/// Trim and length-check a group name
pub fn validate_group_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();

    if len < MIN_GROUP_NAME_LEN {
        return Err(GroupError::InvalidName(format!(
            "must be at least {} characters",
            MIN_GROUP_NAME_LEN
        )));
    }
    if len > MAX_GROUP_NAME_LEN {
        return Err(GroupError::InvalidName(format!(
            "cannot exceed {} characters",
            MAX_GROUP_NAME_LEN
        )));
    }
    Ok(trimmed.to_string())
}
