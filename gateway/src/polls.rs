use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common_net::message::OptionTally;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("poll needs a question and {MIN_OPTIONS}-{MAX_OPTIONS} non-empty options")]
    InvalidInput,
    #[error("poll is not the session's active poll")]
    NoActivePoll,
    #[error("option does not belong to this poll")]
    InvalidOption,
    #[error("only the poll's creator may end it")]
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    votes: HashMap<String, usize>,
}

impl Poll {
    fn tally(&self) -> Vec<OptionTally> {
        let mut counts = vec![0u64; self.options.len()];
        for option in self.votes.values() {
            counts[*option] += 1;
        }
        let total: u64 = counts.iter().sum();

        self.options
            .iter()
            .zip(counts)
            .map(|(text, votes)| OptionTally {
                text: text.clone(),
                votes,
                percentage: if total == 0 {
                    0
                } else {
                    (votes * 100 / total) as u32
                },
            })
            .collect()
    }
}

/// Live polls, one active per session at most. Starting a new poll closes
/// the previous one; a closed poll never accepts another vote. All tally
/// mutation happens under the session's dashmap entry lock, so concurrent
/// votes on the same poll cannot lose updates.
#[derive(Default)]
pub struct PollBoard {
    active: DashMap<String, Poll>,
}

impl PollBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install a fresh active poll, displacing any prior one.
    /// Returns a snapshot for the poll-start broadcast.
    pub fn start_poll(
        &self,
        session_id: &str,
        question: &str,
        options: &[String],
        creator: &str,
    ) -> Result<Poll, PollError> {
        let question = question.trim();
        let options: Vec<String> = options
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        if question.is_empty() || options.len() < MIN_OPTIONS || options.len() > MAX_OPTIONS {
            return Err(PollError::InvalidInput);
        }

        let poll = Poll {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            options,
            creator: creator.to_string(),
            created_at: Utc::now(),
            votes: HashMap::new(),
        };

        if let Some(displaced) = self.active.insert(session_id.to_string(), poll.clone()) {
            info!(session_id, poll_id = %displaced.id, "previous poll closed by new start");
        }
        info!(session_id, poll_id = %poll.id, creator, "poll started");
        Ok(poll)
    }

    /// Record a vote on the active poll. A voter's earlier vote on the same
    /// poll is replaced, so the tally always reflects current sentiment and
    /// sums to the number of distinct voters. Returns the full result set
    /// for the poll-update broadcast.
    pub fn cast_vote(
        &self,
        session_id: &str,
        poll_id: &str,
        option: u32,
        voter: &str,
    ) -> Result<Vec<OptionTally>, PollError> {
        let mut entry = self
            .active
            .get_mut(session_id)
            .ok_or(PollError::NoActivePoll)?;
        if entry.id != poll_id {
            return Err(PollError::NoActivePoll);
        }
        let option = option as usize;
        if option >= entry.options.len() {
            return Err(PollError::InvalidOption);
        }

        entry.votes.insert(voter.to_string(), option);
        Ok(entry.tally())
    }

    /// Close the active poll. Creator only; no further votes afterwards.
    pub fn end_poll(
        &self,
        session_id: &str,
        poll_id: &str,
        requester: &str,
    ) -> Result<Poll, PollError> {
        {
            let entry = self
                .active
                .get(session_id)
                .ok_or(PollError::NoActivePoll)?;
            if entry.id != poll_id {
                return Err(PollError::NoActivePoll);
            }
            if entry.creator != requester {
                return Err(PollError::Unauthorized);
            }
        }

        let (_, poll) = self
            .active
            .remove_if(session_id, |_, poll| poll.id == poll_id)
            .ok_or(PollError::NoActivePoll)?;
        info!(session_id, poll_id, "poll ended");
        Ok(poll)
    }

    pub fn active_poll(&self, session_id: &str) -> Option<Poll> {
        self.active.get(session_id).map(|p| p.clone())
    }
}
