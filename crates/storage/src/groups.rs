//! Group, participant and assignment persistence
//!
//! [`GroupStore`] owns the SQLite tables behind a Secret Santa group. The
//! draw itself is computed elsewhere; this module only guarantees that a
//! group's assignment set is written once, completely, or not at all.
//!
//! The one-set-per-group guarantee lives in the schema: every draw inserts a
//! row into `draws` keyed by `group_id` inside the same transaction as its
//! assignment rows, so a second writer fails on the primary key and rolls
//! back.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use crate::database::{DatabaseConfig, DatabaseError, MigrationDefinition, Result, SqliteDatabase};

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Schema migrations for the group tables
pub fn migrations() -> Vec<MigrationDefinition> {
    vec![
        MigrationDefinition::new(
            1,
            "Create gift groups",
            "CREATE TABLE IF NOT EXISTS gift_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                created_by TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )",
        ),
        MigrationDefinition::new(
            2,
            "Create participants",
            "CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES gift_groups(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                restrictions TEXT,
                confirmed_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (group_id, user_id)
            )",
        ),
        MigrationDefinition::new(
            3,
            "Create draws",
            "CREATE TABLE IF NOT EXISTS draws (
                group_id TEXT PRIMARY KEY REFERENCES gift_groups(id) ON DELETE CASCADE,
                performed_at TEXT NOT NULL
            )",
        ),
        MigrationDefinition::new(
            4,
            "Create assignments",
            "CREATE TABLE IF NOT EXISTS assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id TEXT NOT NULL REFERENCES draws(group_id) ON DELETE CASCADE,
                giver_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                revealed INTEGER NOT NULL DEFAULT 0,
                UNIQUE (group_id, giver_id),
                UNIQUE (group_id, receiver_id)
            )",
        ),
        MigrationDefinition::new(
            5,
            "Index participants by user",
            "CREATE INDEX IF NOT EXISTS idx_participants_user ON participants (user_id)",
        ),
    ]
}

/// A Secret Santa group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Group ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// User who created the group
    pub created_by: String,
    /// Whether the group is active
    pub is_active: bool,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
}

impl GroupRecord {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            created_by: row.try_get("created_by")?,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A group as seen from one of its members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    /// The group
    #[serde(flatten)]
    pub group: GroupRecord,
    /// Total number of participants in the group
    pub participant_count: i64,
    /// Whether the requesting user participates
    pub is_participant: bool,
}

/// A participant row
///
/// `restrictions` is the raw stored JSON. Other clients may have written
/// anything there, so it is not interpreted at this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRow {
    /// Row ID
    pub id: String,
    /// Group the participant belongs to
    pub group_id: String,
    /// Participant's user ID
    pub user_id: String,
    /// Raw restriction data
    pub restrictions: Option<Value>,
    /// When the participant confirmed (RFC 3339)
    pub confirmed_at: Option<String>,
}

impl ParticipantRow {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let raw: Option<String> = row.try_get("restrictions")?;
        let restrictions = raw.map(|text| match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Unparseable restrictions JSON kept as text: {}", e);
                Value::String(text)
            }
        });

        Ok(Self {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            user_id: row.try_get("user_id")?,
            restrictions,
            confirmed_at: row.try_get("confirmed_at")?,
        })
    }

    /// Whether the participant has confirmed
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

/// A giver/receiver pair to be written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentPair {
    /// Giver's user ID
    pub giver_id: String,
    /// Receiver's user ID
    pub receiver_id: String,
}

/// A persisted assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRow {
    /// Group ID
    pub group_id: String,
    /// Giver's user ID
    pub giver_id: String,
    /// Receiver's user ID
    pub receiver_id: String,
    /// Whether the giver has revealed their receiver
    pub revealed: bool,
}

impl AssignmentRow {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            group_id: row.try_get("group_id")?,
            giver_id: row.try_get("giver_id")?,
            receiver_id: row.try_get("receiver_id")?,
            revealed: row.try_get::<i64, _>("revealed")? != 0,
        })
    }
}

/// SQLite-backed store for groups, participants and assignments
#[derive(Debug, Clone)]
pub struct GroupStore {
    db: SqliteDatabase,
}

impl GroupStore {
    /// Wrap an already migrated database
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    /// Open the database at `config.path` and apply pending migrations
    pub async fn open(config: DatabaseConfig) -> Result<Self> {
        let db = SqliteDatabase::new(config).await?;
        db.migrate(&migrations()).await?;
        Ok(Self::new(db))
    }

    /// Create a migrated in-memory store (for testing)
    pub async fn in_memory() -> Result<Self> {
        let db = SqliteDatabase::in_memory().await?;
        db.migrate(&migrations()).await?;
        Ok(Self::new(db))
    }

    /// Get the underlying database
    pub fn database(&self) -> &SqliteDatabase {
        &self.db
    }

    /// Create a group and add its creator as the first participant
    pub async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
        created_by: &str,
    ) -> Result<GroupRecord> {
        let now = timestamp();
        let group = GroupRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_by: created_by.to_string(),
            is_active: true,
            created_at: now.clone(),
        };

        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            "INSERT INTO gift_groups (id, name, description, created_by, is_active, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(&group.created_by)
        .bind(group.is_active)
        .bind(&group.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO participants (id, group_id, user_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&group.id)
        .bind(created_by)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(group_id = %group.id, "Group created");
        Ok(group)
    }

    /// Find a group by ID
    pub async fn find_group(&self, group_id: &str) -> Result<Option<GroupRecord>> {
        let row = sqlx::query("SELECT * FROM gift_groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(self.db.pool())
            .await?;

        row.as_ref().map(GroupRecord::from_row).transpose()
    }

    /// Add a user to a group
    pub async fn add_participant(&self, group_id: &str, user_id: &str) -> Result<ParticipantRow> {
        if self.find_group(group_id).await?.is_none() {
            return Err(DatabaseError::NotFound(format!("group {}", group_id)));
        }

        let participant = ParticipantRow {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            restrictions: None,
            confirmed_at: None,
        };

        let result = sqlx::query(
            "INSERT INTO participants (id, group_id, user_id, created_at)
             SELECT ?, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM draws WHERE group_id = ?)",
        )
        .bind(&participant.id)
        .bind(group_id)
        .bind(user_id)
        .bind(timestamp())
        .bind(group_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::Frozen(format!("group {}", group_id)));
        }
        Ok(participant)
    }

    /// Mark a participant as confirmed
    ///
    /// Confirming twice keeps the first timestamp.
    pub async fn confirm_participant(&self, group_id: &str, user_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE participants SET confirmed_at = COALESCE(confirmed_at, ?)
             WHERE group_id = ? AND user_id = ?
               AND NOT EXISTS (SELECT 1 FROM draws WHERE group_id = ?)",
        )
        .bind(timestamp())
        .bind(group_id)
        .bind(user_id)
        .bind(group_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.unchanged_participant(group_id, user_id).await);
        }
        Ok(())
    }

    /// Replace a participant's restriction list
    pub async fn set_restrictions(
        &self,
        group_id: &str,
        user_id: &str,
        restrictions: &[String],
    ) -> Result<()> {
        let encoded = serde_json::to_string(restrictions)?;

        let result = sqlx::query(
            "UPDATE participants SET restrictions = ?
             WHERE group_id = ? AND user_id = ?
               AND NOT EXISTS (SELECT 1 FROM draws WHERE group_id = ?)",
        )
        .bind(encoded)
        .bind(group_id)
        .bind(user_id)
        .bind(group_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.unchanged_participant(group_id, user_id).await);
        }
        Ok(())
    }

    /// Explain why a guarded participant update touched no row
    async fn unchanged_participant(&self, group_id: &str, user_id: &str) -> DatabaseError {
        let drawn: std::result::Result<i64, _> =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM draws WHERE group_id = ?)")
                .bind(group_id)
                .fetch_one(self.db.pool())
                .await;

        match drawn {
            Ok(0) => DatabaseError::NotFound(format!(
                "participant {} in group {}",
                user_id, group_id
            )),
            Ok(_) => DatabaseError::Frozen(format!("group {}", group_id)),
            Err(e) => e.into(),
        }
    }

    /// List all participants of a group in join order
    pub async fn list_participants(&self, group_id: &str) -> Result<Vec<ParticipantRow>> {
        let rows = sqlx::query("SELECT * FROM participants WHERE group_id = ? ORDER BY rowid")
            .bind(group_id)
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(ParticipantRow::from_row).collect()
    }

    /// List confirmed participants of a group in join order
    pub async fn confirmed_participants(&self, group_id: &str) -> Result<Vec<ParticipantRow>> {
        let rows = sqlx::query(
            "SELECT * FROM participants
             WHERE group_id = ? AND confirmed_at IS NOT NULL
             ORDER BY rowid",
        )
        .bind(group_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(ParticipantRow::from_row).collect()
    }

    /// List the groups a user belongs to, newest first
    pub async fn list_groups_for_user(&self, user_id: &str) -> Result<Vec<GroupSummary>> {
        let rows = sqlx::query(
            "SELECT g.*,
                    (SELECT COUNT(*) FROM participants c WHERE c.group_id = g.id)
                        AS participant_count
             FROM gift_groups g
             JOIN participants p ON p.group_id = g.id
             WHERE p.user_id = ?
             ORDER BY g.created_at DESC, g.rowid DESC",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|row| -> Result<GroupSummary> {
                Ok(GroupSummary {
                    group: GroupRecord::from_row(row)?,
                    participant_count: row.try_get("participant_count")?,
                    is_participant: true,
                })
            })
            .collect()
    }

    /// Whether any assignment exists for the group
    pub async fn has_assignments(&self, group_id: &str) -> Result<bool> {
        let exists: i64 =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM assignments WHERE group_id = ?)")
                .bind(group_id)
                .fetch_one(self.db.pool())
                .await?;
        Ok(exists != 0)
    }

    /// Write a group's complete assignment set in one transaction
    ///
    /// Fails with [`DatabaseError::Conflict`] if the group was already drawn.
    /// On any error nothing is written.
    pub async fn insert_assignments(&self, group_id: &str, pairs: &[AssignmentPair]) -> Result<()> {
        if pairs.is_empty() {
            return Err(DatabaseError::InvalidInput(
                "an assignment set cannot be empty".to_string(),
            ));
        }

        // Dropping `tx` on an early return rolls it back.
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("INSERT INTO draws (group_id, performed_at) VALUES (?, ?)")
            .bind(group_id)
            .bind(timestamp())
            .execute(&mut *tx)
            .await?;

        for pair in pairs {
            sqlx::query(
                "INSERT INTO assignments (group_id, giver_id, receiver_id) VALUES (?, ?, ?)",
            )
            .bind(group_id)
            .bind(&pair.giver_id)
            .bind(&pair.receiver_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(group_id, count = pairs.len(), "Assignments written");
        Ok(())
    }

    /// List a group's assignments
    pub async fn list_assignments(&self, group_id: &str) -> Result<Vec<AssignmentRow>> {
        let rows = sqlx::query("SELECT * FROM assignments WHERE group_id = ? ORDER BY id")
            .bind(group_id)
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(AssignmentRow::from_row).collect()
    }

    /// Find the assignment where `giver_id` is the giver
    pub async fn find_assignment(
        &self,
        group_id: &str,
        giver_id: &str,
    ) -> Result<Option<AssignmentRow>> {
        let row = sqlx::query("SELECT * FROM assignments WHERE group_id = ? AND giver_id = ?")
            .bind(group_id)
            .bind(giver_id)
            .fetch_optional(self.db.pool())
            .await?;

        row.as_ref().map(AssignmentRow::from_row).transpose()
    }

    /// Flag an assignment as revealed to its giver
    pub async fn mark_revealed(&self, group_id: &str, giver_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE assignments SET revealed = 1 WHERE group_id = ? AND giver_id = ?",
        )
        .bind(group_id)
        .bind(giver_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "assignment for {} in group {}",
                giver_id, group_id
            )));
        }
        Ok(())
    }
}
