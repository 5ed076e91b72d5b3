use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Participant, ParticipantId};

/// Smallest roster that may be drawn.
pub const MIN_PARTICIPANTS: usize = 5;
/// Shuffles tried before giving up on finding a derangement.
pub const MAX_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pairing {
    pub participant_id: ParticipantId,
    pub recipient: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignError {
    #[error("at least {required} participants are needed, got {actual}")]
    TooFewParticipants { required: usize, actual: usize },
    #[error("no valid assignment found after {attempts} attempts")]
    AssignmentFailed { attempts: usize },
}

/// Draws recipients for `participants` using the thread-local RNG.
pub fn assign(participants: &[Participant]) -> Result<Vec<Pairing>, AssignError> {
    assign_with_rng(participants, &mut thread_rng())
}

/// Pairs every participant, in input order, with the name at the same
/// position of a shuffled name list in which nobody keeps their own name.
pub fn assign_with_rng<R: Rng + ?Sized>(
    participants: &[Participant],
    rng: &mut R,
) -> Result<Vec<Pairing>, AssignError> {
    if participants.len() < MIN_PARTICIPANTS {
        return Err(AssignError::TooFewParticipants {
            required: MIN_PARTICIPANTS,
            actual: participants.len(),
        });
    }

    let names: Vec<&str> = participants.iter().map(|p| p.name.as_str()).collect();
    let mut shuffled = names.clone();

    for _ in 0..MAX_ATTEMPTS {
        // SliceRandom::shuffle is Fisher-Yates: from the last index down,
        // swap with a uniform index in [0, i].
        shuffled.shuffle(rng);
        if is_derangement(&names, &shuffled) {
            return Ok(participants
                .iter()
                .zip(shuffled)
                .map(|(p, recipient)| Pairing {
                    participant_id: p.id.clone(),
                    recipient: recipient.to_string(),
                })
                .collect());
        }
    }

    Err(AssignError::AssignmentFailed {
        attempts: MAX_ATTEMPTS,
    })
}

fn is_derangement(original: &[&str], shuffled: &[&str]) -> bool {
    original.iter().zip(shuffled).all(|(a, b)| a != b)
}
