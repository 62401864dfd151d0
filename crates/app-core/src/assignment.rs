//! Assignment generation
//!
//! Produces a giver -> receiver permutation with no self-assignments that
//! respects every participant's restrictions, by rejection sampling: each
//! attempt shuffles a fresh copy of the receivers, pairs them positionally
//! with the givers, and is discarded at the first invalid pair.
//!
//! Exhausting the attempt budget is a heuristic failure. When it happens a
//! bipartite matching test tells apart restrictions that admit no valid
//! assignment at all from draws that were merely unlucky, so the log and the
//! error can say which one it was.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::restrictions::RestrictionMap;

/// Default number of shuffles tried before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1000;

/// A single giver -> receiver pairing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Who gives the gift
    pub giver_id: String,

    /// Who receives it
    pub receiver_id: String,
}

/// A successful generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedAssignments {
    /// One assignment per participant, in giver order
    pub assignments: Vec<Assignment>,

    /// Attempt on which a valid permutation was found (1-based)
    pub attempts: u32,
}

/// Generation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    /// Fewer than two participants
    #[error("At least 2 participants are required, got {0}")]
    TooFewParticipants(usize),

    /// No valid permutation found within the attempt budget
    #[error("No valid assignment found after {attempts} attempts (proven infeasible: {proven_infeasible})")]
    Unsatisfiable {
        /// Attempts made
        attempts: u32,
        /// True when no valid assignment exists under these restrictions
        proven_infeasible: bool,
    },
}

/// Result type for generation
pub type Result<T> = std::result::Result<T, GenerateError>;

/// Whether `giver` may give to `receiver`
pub fn is_valid_pair(giver: &str, receiver: &str, restrictions: &RestrictionMap) -> bool {
    giver != receiver && !restrictions.forbids(giver, receiver)
}

/// Shuffle in place with Fisher-Yates
pub fn shuffle<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Generate a valid assignment for `participants`
///
/// Givers keep the order of `participants`. Each attempt starts from a
/// fresh copy of the participant list so no attempt inherits the previous
/// one's arrangement.
pub fn generate_assignments<R: Rng + ?Sized>(
    participants: &[String],
    restrictions: &RestrictionMap,
    max_attempts: u32,
    rng: &mut R,
) -> Result<GeneratedAssignments> {
    if participants.len() < 2 {
        return Err(GenerateError::TooFewParticipants(participants.len()));
    }

    for attempt in 1..=max_attempts {
        let mut receivers = participants.to_vec();
        shuffle(&mut receivers, rng);

        let valid = participants
            .iter()
            .zip(&receivers)
            .all(|(giver, receiver)| is_valid_pair(giver, receiver, restrictions));

        if valid {
            let assignments = participants
                .iter()
                .cloned()
                .zip(receivers)
                .map(|(giver_id, receiver_id)| Assignment {
                    giver_id,
                    receiver_id,
                })
                .collect();

            tracing::debug!(attempt, participants = participants.len(), "Valid assignment found");
            return Ok(GeneratedAssignments {
                assignments,
                attempts: attempt,
            });
        }
    }

    let proven_infeasible = !has_valid_assignment(participants, restrictions);
    if proven_infeasible {
        tracing::warn!(
            max_attempts,
            "Restrictions admit no valid assignment"
        );
    } else {
        tracing::warn!(
            max_attempts,
            "A valid assignment exists but none was found within the attempt budget"
        );
    }

    Err(GenerateError::Unsatisfiable {
        attempts: max_attempts,
        proven_infeasible,
    })
}

/// Whether any valid assignment exists
///
/// A valid assignment is a perfect matching in the bipartite graph joining
/// each giver to the receivers they may draw. Uses augmenting paths, which
/// is O(n^3) in the worst case and fine for group-sized inputs.
pub fn has_valid_assignment(participants: &[String], restrictions: &RestrictionMap) -> bool {
    let n = participants.len();
    if n < 2 {
        return false;
    }

    let allowed: Vec<Vec<usize>> = participants
        .iter()
        .map(|giver| {
            participants
                .iter()
                .enumerate()
                .filter(|(_, receiver)| is_valid_pair(giver, receiver, restrictions))
                .map(|(j, _)| j)
                .collect()
        })
        .collect();

    let mut giver_of: Vec<Option<usize>> = vec![None; n];
    (0..n).all(|giver| {
        let mut visited = vec![false; n];
        augment(giver, &allowed, &mut visited, &mut giver_of)
    })
}

fn augment(
    giver: usize,
    allowed: &[Vec<usize>],
    visited: &mut [bool],
    giver_of: &mut [Option<usize>],
) -> bool {
    for &receiver in &allowed[giver] {
        if visited[receiver] {
            continue;
        }
        visited[receiver] = true;

        let free = match giver_of[receiver] {
            None => true,
            Some(other) => augment(other, allowed, visited, giver_of),
        };
        if free {
            giver_of[receiver] = Some(giver);
            return true;
        }
    }
    false
}
