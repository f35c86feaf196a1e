//! Per-poll vote bookkeeping
//!
//! A `Tally` belongs to exactly one poll. It enforces at most one vote per
//! participant by checking the participant -> option map before touching any
//! counter, so a rejected vote leaves the tally unchanged.

use crate::error::SessionError;
use crate::protocol::OptionResult;
use crate::types::{OptionId, ParticipantId, PollOption};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Tally {
    /// Option ids in presentation order; `counts` is indexed the same way
    option_ids: Vec<OptionId>,
    counts: Vec<u32>,
    choices: HashMap<ParticipantId, OptionId>,
}

impl Tally {
    pub fn new(options: &[PollOption]) -> Self {
        Self {
            option_ids: options.iter().map(|o| o.id.clone()).collect(),
            counts: vec![0; options.len()],
            choices: HashMap::new(),
        }
    }

    /// Record a participant's vote, rejecting unknown options and repeat voters
    pub fn record_vote(
        &mut self,
        participant_id: &ParticipantId,
        option_id: &OptionId,
    ) -> Result<(), SessionError> {
        let index = self
            .option_ids
            .iter()
            .position(|id| id == option_id)
            .ok_or_else(|| SessionError::UnknownOption(option_id.clone()))?;

        if self.choices.contains_key(participant_id) {
            return Err(SessionError::AlreadyAnswered);
        }

        self.choices
            .insert(participant_id.clone(), option_id.clone());
        self.counts[index] += 1;
        Ok(())
    }

    pub fn total_votes(&self) -> u32 {
        self.counts.iter().sum()
    }

    pub fn count_for(&self, option_id: &OptionId) -> u32 {
        self.option_ids
            .iter()
            .position(|id| id == option_id)
            .map(|i| self.counts[i])
            .unwrap_or(0)
    }

    /// Ordered per-option counts and percentages
    pub fn snapshot(&self, options: &[PollOption]) -> Vec<OptionResult> {
        let total = self.total_votes();

        options
            .iter()
            .map(|option| {
                let votes = self.count_for(&option.id);
                OptionResult {
                    option_id: option.id.clone(),
                    text: option.text.clone(),
                    is_correct: option.is_correct,
                    votes,
                    percentage: percentage(votes, total),
                }
            })
            .collect()
    }
}

/// `votes / total` as a whole percentage, ties rounded half-up; 0 with no votes
pub fn percentage(votes: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let (votes, total) = (u64::from(votes), u64::from(total));
    ((200 * votes + total) / (2 * total)) as u32
}
