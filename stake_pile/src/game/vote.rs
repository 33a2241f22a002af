//! Peer vote gating a card replenishment.
//!
//! A player asks for new cards, the other active players vote, and the
//! request passes on a strict yes majority. Voters are frozen when the
//! ballot opens; missing votes count as no when the window closes.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::entities::UserId;
use super::state_machine::{GameError, GameState};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ballot {
    pub requester: UserId,
    pub eligible: Vec<UserId>,
    votes: HashMap<UserId, bool>,
    pub opened_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
}

impl Ballot {
    pub fn has_voted(&self, voter: UserId) -> bool {
        self.votes.contains_key(&voter)
    }

    fn is_complete(&self) -> bool {
        self.votes.len() == self.eligible.len()
    }

    fn tally(&self) -> VoteResult {
        let yes = self.votes.values().filter(|v| **v).count();
        // Abstentions count against.
        let no = self.eligible.len() - yes;
        VoteResult {
            requester: self.requester,
            approved: yes > no,
            yes,
            no,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResult {
    pub requester: UserId,
    pub approved: bool,
    pub yes: usize,
    pub no: usize,
}

#[derive(Debug)]
pub struct VoteCoordinator {
    ballot: Option<Ballot>,
    window: TimeDelta,
}

impl VoteCoordinator {
    pub fn new(window: TimeDelta) -> Self {
        Self {
            ballot: None,
            window,
        }
    }

    pub fn ballot(&self) -> Option<&Ballot> {
        self.ballot.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.ballot.is_some()
    }

    pub fn closes_at(&self) -> Option<DateTime<Utc>> {
        self.ballot.as_ref().map(|b| b.closes_at)
    }

    /// Open a ballot for `requester`. Returns the result right away when no
    /// one is left to vote; otherwise `None` and the ballot stays open.
    pub fn request(
        &mut self,
        state: &GameState,
        requester: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<VoteResult>, GameError> {
        if self.ballot.is_some() {
            return Err(GameError::VoteInProgress);
        }
        state.ensure_can_request_replenishment(requester)?;

        let ballot = Ballot {
            requester,
            eligible: state.eligible_voters(requester),
            votes: HashMap::new(),
            opened_at: now,
            closes_at: now + self.window,
        };
        if ballot.eligible.is_empty() {
            return Ok(Some(ballot.tally()));
        }
        self.ballot = Some(ballot);
        Ok(None)
    }

    /// Record one vote. Resolves the ballot once every eligible voter has
    /// answered.
    pub fn submit(&mut self, voter: UserId, approve: bool) -> Result<Option<VoteResult>, GameError> {
        let ballot = self.ballot.as_mut().ok_or(GameError::NoVoteInProgress)?;
        if !ballot.eligible.contains(&voter) {
            return Err(GameError::NotEligibleVoter);
        }
        if ballot.has_voted(voter) {
            return Err(GameError::AlreadyVoted);
        }
        ballot.votes.insert(voter, approve);

        if ballot.is_complete() {
            return Ok(self.ballot.take().map(|b| b.tally()));
        }
        Ok(None)
    }

    /// Close the window and count what's in.
    pub fn expire(&mut self) -> Option<VoteResult> {
        self.ballot.take().map(|b| b.tally())
    }

    /// Drop the ballot without a result, e.g. when the game ends.
    pub fn cancel(&mut self) -> Option<Ballot> {
        self.ballot.take()
    }
}
