//! Tournament domain models: matches, ratings and the rating ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::hypothesis::Hypothesis;

/// How much scrutiny a match gets from the comparison collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebateDepth {
    SingleTurn,
    MultiTurn,
}

impl DebateDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleTurn => "single-turn",
            Self::MultiTurn => "multi-turn",
        }
    }
}

/// Result of a match from one participant's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchResult {
    Win,
    Draw,
    Loss,
}

impl MatchResult {
    /// Actual score fed into the Elo update.
    pub fn score(&self) -> f64 {
        match self {
            Self::Win => 1.0,
            Self::Draw => 0.5,
            Self::Loss => 0.0,
        }
    }

    pub fn inverse(&self) -> Self {
        match self {
            Self::Win => Self::Loss,
            Self::Draw => Self::Draw,
            Self::Loss => Self::Win,
        }
    }
}

/// A pairwise comparison between two distinct hypotheses.
///
/// Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub hypothesis_a_id: Uuid,
    pub hypothesis_b_id: Uuid,
    /// Set on resolution; stays `None` for a draw
    pub winner_id: Option<Uuid>,
    pub debate_depth: DebateDepth,
    /// The rank-match task carrying this comparison
    pub task_id: Option<Uuid>,
    /// Rating change applied to `hypothesis_a_id` (B got the negation)
    pub rating_delta_a: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Match {
    pub fn new(a: Uuid, b: Uuid, depth: DebateDepth) -> Result<Self, String> {
        if a == b {
            return Err(format!("Hypothesis {a} cannot be matched against itself"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            hypothesis_a_id: a,
            hypothesis_b_id: b,
            winner_id: None,
            debate_depth: depth,
            task_id: None,
            rating_delta_a: None,
            created_at: Utc::now(),
            resolved_at: None,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn involves(&self, hypothesis_id: Uuid) -> bool {
        self.hypothesis_a_id == hypothesis_id || self.hypothesis_b_id == hypothesis_id
    }

    /// Result for participant A given a winner (`None` = draw).
    pub fn result_for_a(&self, winner_id: Option<Uuid>) -> Result<MatchResult, String> {
        match winner_id {
            None => Ok(MatchResult::Draw),
            Some(w) if w == self.hypothesis_a_id => Ok(MatchResult::Win),
            Some(w) if w == self.hypothesis_b_id => Ok(MatchResult::Loss),
            Some(w) => Err(format!("Winner {w} is not a participant of match {}", self.id)),
        }
    }

    /// Record the outcome. Fails if already resolved.
    pub fn resolve(
        &mut self,
        winner_id: Option<Uuid>,
        rating_delta_a: Option<f64>,
    ) -> Result<(), String> {
        if self.is_resolved() {
            return Err(format!("Match {} is already resolved", self.id));
        }
        self.result_for_a(winner_id)?;
        self.winner_id = winner_id;
        self.rating_delta_a = rating_delta_a;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    /// Order-independent identity of the pairing.
    pub fn pair_key(&self) -> PairKey {
        PairKey::new(self.hypothesis_a_id, self.hypothesis_b_id)
    }
}

/// Unordered pair of hypothesis ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey(pub Uuid, pub Uuid);

impl PairKey {
    pub fn new(a: Uuid, b: Uuid) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }
}

/// Elo state for one hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub elo: f64,
    pub match_count: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub enrolled_at: DateTime<Utc>,
    pub last_match_at: Option<DateTime<Utc>>,
}

impl Rating {
    pub fn new(initial: f64) -> Self {
        Self {
            elo: initial,
            match_count: 0,
            wins: 0,
            draws: 0,
            losses: 0,
            enrolled_at: Utc::now(),
            last_match_at: None,
        }
    }

    pub fn record(&mut self, result: MatchResult, delta: f64) {
        self.elo += delta;
        self.match_count += 1;
        match result {
            MatchResult::Win => self.wins += 1,
            MatchResult::Draw => self.draws += 1,
            MatchResult::Loss => self.losses += 1,
        }
        self.last_match_at = Some(Utc::now());
    }
}

/// Every rating plus the ids of matches already applied.
///
/// Stored under a single Context Memory key so one compare-and-set updates
/// both participants and the idempotency marker together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingLedger {
    pub ratings: BTreeMap<Uuid, Rating>,
    pub resolved_matches: BTreeSet<Uuid>,
}

impl RatingLedger {
    pub fn rating(&self, id: Uuid) -> Option<&Rating> {
        self.ratings.get(&id)
    }

    pub fn is_applied(&self, match_id: Uuid) -> bool {
        self.resolved_matches.contains(&match_id)
    }
}

/// Pairs already scheduled, resolved or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairingBook {
    pub scheduled: BTreeSet<PairKey>,
    /// Matches scheduled but not yet resolved
    pub open_matches: BTreeSet<Uuid>,
}

/// A hypothesis joined with its current rating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub rank: usize,
    pub hypothesis: Hypothesis,
    pub elo_rating: f64,
    pub match_count: u32,
}
