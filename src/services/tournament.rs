//! Tournament / ranking engine.
//!
//! The tournament is both a producer of `rank-match` tasks and the only
//! writer of Elo ratings. Ratings and the set of applied match ids share the
//! `tournament/ledger` key, so one compare-and-set moves both participants
//! and marks the match as applied. A second delivery of the same result
//! finds the marker and changes nothing.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::context::keys;
use crate::domain::models::{
    CasOutcome, DebateDepth, Hypothesis, Match, MatchResult, PairKey, PairingBook, Rating,
    RatingLedger, Standing, Task, TaskPayload, TaskSource, TournamentConfig, TournamentProgress,
    ABSENT_VERSION,
};
use crate::services::{ContextMemory, EloCalculator, HypothesisRegistry, TaskQueue};

/// What happened when a match result was delivered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchApplication {
    /// False when the result had already been applied
    pub applied: bool,
    /// Change to participant A's rating, when applied now
    pub rating_delta_a: Option<f64>,
}

/// A hypothesis as seen by the pairing policy.
#[derive(Debug, Clone)]
struct Contender {
    hypothesis: Hypothesis,
    /// 1-based rank among eligible hypotheses
    rank: usize,
    match_count: u32,
    /// Pairs already scheduled for it, resolved or not
    participation: usize,
}

pub struct Tournament {
    memory: ContextMemory,
    registry: HypothesisRegistry,
    queue: Arc<TaskQueue>,
    config: TournamentConfig,
    elo: EloCalculator,
    rng: Mutex<StdRng>,
    halted: AtomicBool,
}

impl Tournament {
    pub fn new(memory: ContextMemory, queue: Arc<TaskQueue>, config: TournamentConfig) -> Self {
        Self::with_rng(memory, queue, config, StdRng::from_os_rng())
    }

    /// Deterministic pairing for tests.
    pub fn with_seed(
        memory: ContextMemory,
        queue: Arc<TaskQueue>,
        config: TournamentConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(memory, queue, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        memory: ContextMemory,
        queue: Arc<TaskQueue>,
        config: TournamentConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            registry: HypothesisRegistry::new(memory.clone()),
            elo: EloCalculator::new(config.k_factor),
            memory,
            queue,
            config,
            rng: Mutex::new(rng),
            halted: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TournamentConfig {
        &self.config
    }

    /// Stop scheduling new matches. Results keep being applied.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            info!("Tournament scheduling halted");
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub async fn ledger(&self) -> DomainResult<RatingLedger> {
        Ok(self
            .memory
            .get_or_default::<RatingLedger>(keys::TOURNAMENT_LEDGER)
            .await?
            .0)
    }

    pub async fn pairing_book(&self) -> DomainResult<PairingBook> {
        Ok(self
            .memory
            .get_or_default::<PairingBook>(keys::TOURNAMENT_PAIRINGS)
            .await?
            .0)
    }

    pub async fn get_match(&self, match_id: Uuid) -> DomainResult<Match> {
        self.memory
            .get_json::<Match>(&keys::tournament_match(match_id))
            .await?
            .map(|(m, _)| m)
            .ok_or(DomainError::MatchNotFound(match_id))
    }

    /// Give each hypothesis the initial rating unless it already has one.
    /// Returns how many were newly enrolled.
    pub async fn enroll(&self, hypothesis_ids: &[Uuid]) -> DomainResult<usize> {
        let initial = self.config.initial_rating;
        let enrolled = self
            .memory
            .try_update::<RatingLedger, usize, _>(keys::TOURNAMENT_LEDGER, |ledger| {
                let mut added = 0;
                for &id in hypothesis_ids {
                    if !ledger.ratings.contains_key(&id) {
                        ledger.ratings.insert(id, Rating::new(initial));
                        added += 1;
                    }
                }
                Ok((added > 0).then_some(added))
            })
            .await?
            .unwrap_or(0);

        if enrolled > 0 {
            debug!(enrolled, "Hypotheses enrolled in tournament");
        }
        Ok(enrolled)
    }

    /// Every registered hypothesis with its rating, best first.
    pub async fn standings(&self) -> DomainResult<Vec<Standing>> {
        let hypotheses = self.registry.all().await?;
        let ledger = self.ledger().await?;
        Ok(build_standings(hypotheses, &ledger, self.config.initial_rating))
    }

    pub async fn progress(&self) -> DomainResult<TournamentProgress> {
        let ledger = self.ledger().await?;
        let book = self.pairing_book().await?;
        let eligible = self.registry.eligible().await?.len();
        Ok(TournamentProgress {
            enrolled: ledger.ratings.len(),
            scheduled_pairs: book.scheduled.len(),
            open_matches: book.open_matches.len(),
            resolved_matches: ledger.resolved_matches.len(),
            possible_pairs: eligible * eligible.saturating_sub(1) / 2,
        })
    }

    /// Schedule as many new matches as free slots allow.
    ///
    /// At most `max_pending_matches` matches are unresolved at once and an
    /// unordered pair is never scheduled twice. Stops early without error
    /// when the queue pushes back.
    #[instrument(skip(self), err)]
    pub async fn schedule_matches(&self) -> DomainResult<Vec<Match>> {
        if self.is_halted() {
            return Ok(Vec::new());
        }

        let book = self.pairing_book().await?;
        let slots = self
            .config
            .max_pending_matches
            .saturating_sub(book.open_matches.len());
        if slots == 0 {
            return Ok(Vec::new());
        }

        let eligible = self.registry.eligible().await?;
        if eligible.len() < 2 {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = eligible.iter().map(|h| h.id).collect();
        self.enroll(&ids).await?;

        let ledger = self.ledger().await?;
        let (clusters, _) = self
            .memory
            .get_or_default::<Vec<Vec<Uuid>>>(keys::PROXIMITY_CLUSTERS)
            .await?;

        let contenders = rank_contenders(eligible, &ledger, &book, self.config.initial_rating);
        let pairs = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            select_pairs(
                &contenders,
                &book,
                &clusters,
                self.config.multi_turn_rank_cutoff,
                slots,
                &mut *rng,
            )
        };

        let mut scheduled = Vec::with_capacity(pairs.len());
        for (i, j) in pairs {
            let (a, b) = (&contenders[i], &contenders[j]);
            let depth = self.debate_depth(a, b);
            match self.schedule_one(&a.hypothesis, &b.hypothesis, depth).await {
                Ok(Some(m)) => scheduled.push(m),
                Ok(None) => {}
                Err(DomainError::QueueFull { max_size }) => {
                    debug!(max_size, "Queue full, deferring remaining matches");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if !scheduled.is_empty() {
            info!(count = scheduled.len(), "Scheduled matches");
        }
        Ok(scheduled)
    }

    /// Multi-turn only when both sides rank within the cutoff and both have
    /// a rating backed by at least one match.
    fn debate_depth(&self, a: &Contender, b: &Contender) -> DebateDepth {
        let cutoff = self.config.multi_turn_rank_cutoff;
        let established = a.match_count > 0 && b.match_count > 0;
        if established && a.rank <= cutoff && b.rank <= cutoff {
            DebateDepth::MultiTurn
        } else {
            DebateDepth::SingleTurn
        }
    }

    async fn schedule_one(
        &self,
        a: &Hypothesis,
        b: &Hypothesis,
        depth: DebateDepth,
    ) -> DomainResult<Option<Match>> {
        let mut m = Match::new(a.id, b.id, depth).map_err(DomainError::ValidationFailed)?;
        let task = Task::new(TaskPayload::RankMatch {
            match_id: m.id,
            hypothesis_a: a.clone(),
            hypothesis_b: b.clone(),
            depth,
        })
        .with_priority(self.config.match_priority)
        .with_source(TaskSource::Tournament);
        m.task_id = Some(task.id);

        let pair = m.pair_key();
        let match_id = m.id;
        let reserved = self
            .memory
            .try_update::<PairingBook, (), _>(keys::TOURNAMENT_PAIRINGS, |book| {
                if book.scheduled.contains(&pair) {
                    return Ok(None);
                }
                book.scheduled.insert(pair);
                book.open_matches.insert(match_id);
                Ok(Some(()))
            })
            .await?;
        if reserved.is_none() {
            return Ok(None);
        }

        if let Err(e) = self.publish(&m, task).await {
            if let Err(release_error) = self.release(match_id, Some(pair)).await {
                warn!(%match_id, error = %release_error, "Failed to release match reservation");
            }
            return Err(e);
        }

        debug!(%match_id, a = %a.id, b = %b.id, depth = depth.as_str(), "Match scheduled");
        Ok(Some(m))
    }

    /// Write the new match record and enqueue its task.
    async fn publish(&self, m: &Match, task: Task) -> DomainResult<()> {
        let key = keys::tournament_match(m.id);
        if let CasOutcome::Conflict(_) = self.memory.cas_json(&key, ABSENT_VERSION, m).await? {
            return Err(DomainError::ConcurrentModification { key, attempts: 1 });
        }
        self.queue.enqueue(task).await?;
        Ok(())
    }

    /// Free a match's slot; with `pair`, also make the pair schedulable again.
    async fn release(&self, match_id: Uuid, pair: Option<PairKey>) -> DomainResult<()> {
        self.memory
            .try_update::<PairingBook, (), _>(keys::TOURNAMENT_PAIRINGS, |book| {
                let removed_match = book.open_matches.remove(&match_id);
                let removed_pair = pair.is_some_and(|p| book.scheduled.remove(&p));
                Ok((removed_match || removed_pair).then_some(()))
            })
            .await?;
        Ok(())
    }

    /// Give up on a match whose task failed terminally. The pair stays
    /// scheduled so it is not retried forever.
    pub async fn abandon_match(&self, match_id: Uuid) -> DomainResult<()> {
        warn!(%match_id, "Abandoning match");
        self.release(match_id, None).await
    }

    /// Free open matches that no live task will ever resolve.
    ///
    /// A checkpoint can capture a match reservation without its task, since
    /// scheduling writes the reservation before enqueueing. Such pairs
    /// become schedulable again. Matches whose task already ended only give
    /// their slot back. Returns how many matches were released.
    pub async fn release_orphaned_matches(&self) -> DomainResult<usize> {
        let book = self.pairing_book().await?;
        let mut released = 0;

        for match_id in book.open_matches {
            let record = self
                .memory
                .get_json::<Match>(&keys::tournament_match(match_id))
                .await?
                .map(|(m, _)| m);
            let task = match record.as_ref().and_then(|m| m.task_id) {
                Some(task_id) => self.queue.get(task_id).await,
                None => None,
            };

            match (record, task) {
                (_, Some(task)) if !task.is_terminal() => continue,
                (_, Some(_)) => self.release(match_id, None).await?,
                (Some(m), None) => self.release(match_id, Some(m.pair_key())).await?,
                (None, None) => self.release(match_id, None).await?,
            }
            released += 1;
            warn!(%match_id, "Released orphaned match");
        }
        Ok(released)
    }

    /// Apply a resolved match to the ratings.
    ///
    /// `winner_id = None` is a draw. Idempotent per match id.
    #[instrument(skip(self), err)]
    pub async fn apply_match_result(
        &self,
        match_id: Uuid,
        hypothesis_a: Uuid,
        hypothesis_b: Uuid,
        winner_id: Option<Uuid>,
    ) -> DomainResult<MatchApplication> {
        let result_a = match winner_id {
            None => MatchResult::Draw,
            Some(w) if w == hypothesis_a => MatchResult::Win,
            Some(w) if w == hypothesis_b => MatchResult::Loss,
            Some(w) => {
                return Err(DomainError::ValidationFailed(format!(
                    "Winner {w} is not a participant of match {match_id}"
                )))
            }
        };
        if hypothesis_a == hypothesis_b {
            return Err(DomainError::ValidationFailed(format!(
                "Match {match_id} has identical participants"
            )));
        }

        let initial = self.config.initial_rating;
        let elo = self.elo;
        let delta = self
            .memory
            .try_update::<RatingLedger, f64, _>(keys::TOURNAMENT_LEDGER, |ledger| {
                if ledger.is_applied(match_id) {
                    return Ok(None);
                }
                let rating_a = ledger.rating(hypothesis_a).map_or(initial, |r| r.elo);
                let rating_b = ledger.rating(hypothesis_b).map_or(initial, |r| r.elo);
                let delta = elo.rating_delta(rating_a, rating_b, result_a);

                ledger
                    .ratings
                    .entry(hypothesis_a)
                    .or_insert_with(|| Rating::new(initial))
                    .record(result_a, delta);
                ledger
                    .ratings
                    .entry(hypothesis_b)
                    .or_insert_with(|| Rating::new(initial))
                    .record(result_a.inverse(), -delta);
                ledger.resolved_matches.insert(match_id);
                Ok(Some(delta))
            })
            .await?;

        if delta.is_none() {
            debug!(%match_id, "Match result already applied");
        }

        self.memory
            .try_update::<Option<Match>, (), _>(&keys::tournament_match(match_id), |record| {
                let m = record.get_or_insert_with(|| Match {
                    id: match_id,
                    hypothesis_a_id: hypothesis_a,
                    hypothesis_b_id: hypothesis_b,
                    winner_id: None,
                    debate_depth: DebateDepth::SingleTurn,
                    task_id: None,
                    rating_delta_a: None,
                    created_at: Utc::now(),
                    resolved_at: None,
                });
                if m.is_resolved() {
                    return Ok(None);
                }
                m.resolve(winner_id, delta)
                    .map_err(DomainError::ValidationFailed)?;
                Ok(Some(()))
            })
            .await?;

        self.release(match_id, None).await?;

        if let Some(d) = delta {
            info!(
                %match_id,
                winner = ?winner_id,
                rating_delta_a = d,
                "Match result applied"
            );
        }
        Ok(MatchApplication {
            applied: delta.is_some(),
            rating_delta_a: delta,
        })
    }

    /// Singleton scheduling loop. Errors are logged, never fatal.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_millis(self.config.schedule_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Tournament loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.schedule_matches().await {
                        warn!(error = %e, "Match scheduling failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Tournament loop received shutdown signal");
                    break;
                }
            }
        }
    }
}

/// Join hypotheses with their ratings, best first.
///
/// Ties on Elo go to the hypothesis with more matches, then the older one.
pub fn build_standings(
    hypotheses: Vec<Hypothesis>,
    ledger: &RatingLedger,
    initial_rating: f64,
) -> Vec<Standing> {
    let mut rows: Vec<(Hypothesis, f64, u32)> = hypotheses
        .into_iter()
        .map(|h| {
            let (elo, matches) = ledger
                .rating(h.id)
                .map_or((initial_rating, 0), |r| (r.elo, r.match_count));
            (h, elo, matches)
        })
        .collect();

    rows.sort_by(|(ha, ea, ma), (hb, eb, mb)| {
        eb.total_cmp(ea)
            .then_with(|| mb.cmp(ma))
            .then_with(|| ha.created_at.cmp(&hb.created_at))
            .then_with(|| ha.id.cmp(&hb.id))
    });

    rows.into_iter()
        .enumerate()
        .map(|(i, (hypothesis, elo_rating, match_count))| Standing {
            rank: i + 1,
            hypothesis,
            elo_rating,
            match_count,
        })
        .collect()
}

fn rank_contenders(
    eligible: Vec<Hypothesis>,
    ledger: &RatingLedger,
    book: &PairingBook,
    initial_rating: f64,
) -> Vec<Contender> {
    let mut participation: HashMap<Uuid, usize> = HashMap::new();
    for PairKey(a, b) in &book.scheduled {
        *participation.entry(*a).or_default() += 1;
        *participation.entry(*b).or_default() += 1;
    }

    build_standings(eligible, ledger, initial_rating)
        .into_iter()
        .map(|s| Contender {
            participation: participation.get(&s.hypothesis.id).copied().unwrap_or(0),
            rank: s.rank,
            match_count: s.match_count,
            hypothesis: s.hypothesis,
        })
        .collect()
}

/// Pick up to `slots` unscheduled pairs, as indices into `contenders`.
///
/// Precedence: pairs inside one proximity cluster, then pairs involving a
/// fresh (least matched) or top-ranked hypothesis, then everything else.
/// Within a tier, pairs whose members have played less and rank higher come
/// first; remaining ties are broken at random.
fn select_pairs(
    contenders: &[Contender],
    book: &PairingBook,
    clusters: &[Vec<Uuid>],
    top_cutoff: usize,
    slots: usize,
    rng: &mut impl Rng,
) -> Vec<(usize, usize)> {
    let cluster_of: BTreeMap<Uuid, usize> = clusters
        .iter()
        .enumerate()
        .flat_map(|(c, members)| members.iter().map(move |id| (*id, c)))
        .collect();
    let min_participation = contenders.iter().map(|c| c.participation).min().unwrap_or(0);
    let top_cutoff = top_cutoff.max(1);
    let is_priority = |c: &Contender| c.participation == min_participation || c.rank <= top_cutoff;

    let mut candidates: Vec<(u8, f64, f64, usize, usize)> = Vec::new();
    for i in 0..contenders.len() {
        for j in (i + 1)..contenders.len() {
            let (a, b) = (&contenders[i], &contenders[j]);
            if book
                .scheduled
                .contains(&PairKey::new(a.hypothesis.id, b.hypothesis.id))
            {
                continue;
            }

            let same_cluster = matches!(
                (cluster_of.get(&a.hypothesis.id), cluster_of.get(&b.hypothesis.id)),
                (Some(ca), Some(cb)) if ca == cb
            );
            let tier = if same_cluster {
                0
            } else if is_priority(a) || is_priority(b) {
                1
            } else {
                2
            };
            let score = if tier == 2 {
                0.0
            } else {
                freshness(a) + freshness(b) + 1.0 / a.rank as f64 + 1.0 / b.rank as f64
            };
            candidates.push((tier, score, rng.random::<f64>(), i, j));
        }
    }

    candidates.sort_by(|x, y| {
        x.0.cmp(&y.0)
            .then_with(|| y.1.total_cmp(&x.1))
            .then_with(|| x.2.total_cmp(&y.2))
    });
    candidates
        .into_iter()
        .take(slots)
        .map(|(_, _, _, i, j)| (i, j))
        .collect()
}

fn freshness(c: &Contender) -> f64 {
    1.0 / (1.0 + c.participation as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryContextStore;
    use crate::domain::models::{ContextEntry, HypothesisDraft, QueueConfig, RetryConfig, TaskType};
    use crate::domain::ports::ContextStore;
    use serde_json::json;

    struct Fixture {
        tournament: Tournament,
        registry: HypothesisRegistry,
        queue: Arc<TaskQueue>,
    }

    fn fixture(config: TournamentConfig) -> Fixture {
        let memory = ContextMemory::new(Arc::new(InMemoryContextStore::new()), &RetryConfig::default());
        let queue = Arc::new(TaskQueue::new(QueueConfig::default(), RetryConfig::default()));
        Fixture {
            tournament: Tournament::with_seed(memory.clone(), queue.clone(), config, 7),
            registry: HypothesisRegistry::new(memory),
            queue,
        }
    }

    async fn seed(registry: &HypothesisRegistry, n: usize) -> Vec<Hypothesis> {
        let drafts = (0..n)
            .map(|i| HypothesisDraft::new(json!({ "n": i }), "test"))
            .collect();
        registry
            .register_from_task(Uuid::new_v4(), drafts)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_result_is_symmetric_and_idempotent() {
        let f = fixture(TournamentConfig::default());
        let hs = seed(&f.registry, 2).await;
        let (a, b) = (hs[0].id, hs[1].id);
        f.tournament.enroll(&[a, b]).await.unwrap();
        let match_id = Uuid::new_v4();

        let first = f
            .tournament
            .apply_match_result(match_id, a, b, Some(a))
            .await
            .unwrap();
        assert!(first.applied);
        assert!((first.rating_delta_a.unwrap() - 16.0).abs() < 1e-9);

        let again = f
            .tournament
            .apply_match_result(match_id, a, b, Some(b))
            .await
            .unwrap();
        assert!(!again.applied);

        let ledger = f.tournament.ledger().await.unwrap();
        assert!((ledger.rating(a).unwrap().elo - 1216.0).abs() < 1e-9);
        assert!((ledger.rating(b).unwrap().elo - 1184.0).abs() < 1e-9);
        assert_eq!(ledger.rating(a).unwrap().match_count, 1);

        let record = f.tournament.get_match(match_id).await.unwrap();
        assert_eq!(record.winner_id, Some(a));
    }

    #[tokio::test]
    async fn test_draw_is_recorded() {
        let f = fixture(TournamentConfig::default());
        let hs = seed(&f.registry, 2).await;
        let outcome = f
            .tournament
            .apply_match_result(Uuid::new_v4(), hs[0].id, hs[1].id, None)
            .await
            .unwrap();
        assert_eq!(outcome.rating_delta_a, Some(0.0));

        let ledger = f.tournament.ledger().await.unwrap();
        assert_eq!(ledger.rating(hs[0].id).unwrap().draws, 1);
    }

    #[tokio::test]
    async fn test_foreign_winner_is_rejected() {
        let f = fixture(TournamentConfig::default());
        let hs = seed(&f.registry, 2).await;
        let err = f
            .tournament
            .apply_match_result(Uuid::new_v4(), hs[0].id, hs[1].id, Some(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
        assert!(f.tournament.ledger().await.unwrap().resolved_matches.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_respects_slots_and_never_repeats_pairs() {
        let f = fixture(TournamentConfig {
            max_pending_matches: 4,
            ..TournamentConfig::default()
        });
        seed(&f.registry, 4).await;

        let first = f.tournament.schedule_matches().await.unwrap();
        assert_eq!(first.len(), 4);
        assert!(f.tournament.schedule_matches().await.unwrap().is_empty());

        for m in &first {
            f.tournament
                .apply_match_result(m.id, m.hypothesis_a_id, m.hypothesis_b_id, Some(m.hypothesis_a_id))
                .await
                .unwrap();
        }
        let second = f.tournament.schedule_matches().await.unwrap();
        assert_eq!(second.len(), 2);

        let mut pairs: Vec<PairKey> = first.iter().chain(&second).map(Match::pair_key).collect();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), 6);
        assert_eq!(f.queue.metrics().await.type_metrics(TaskType::RankMatch).waiting, 6);
    }

    #[tokio::test]
    async fn test_cluster_pairs_come_first() {
        let f = fixture(TournamentConfig {
            max_pending_matches: 1,
            ..TournamentConfig::default()
        });
        let hs = seed(&f.registry, 6).await;
        let memory = f.tournament.memory.clone();
        memory
            .cas_json(keys::PROXIMITY_CLUSTERS, 0, &vec![vec![hs[2].id, hs[5].id]])
            .await
            .unwrap();

        let scheduled = f.tournament.schedule_matches().await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].pair_key(), PairKey::new(hs[2].id, hs[5].id));
    }

    #[tokio::test]
    async fn test_multi_turn_needs_established_top_ranks() {
        let f = fixture(TournamentConfig {
            multi_turn_rank_cutoff: 2,
            max_pending_matches: 1,
            ..TournamentConfig::default()
        });
        let hs = seed(&f.registry, 3).await;
        f.tournament.enroll(&hs.iter().map(|h| h.id).collect::<Vec<_>>()).await.unwrap();

        let first = f.tournament.schedule_matches().await.unwrap();
        assert_eq!(first[0].debate_depth, DebateDepth::SingleTurn);
        let m = &first[0];
        f.tournament
            .apply_match_result(m.id, m.hypothesis_a_id, m.hypothesis_b_id, None)
            .await
            .unwrap();

        // Only the third hypothesis is unmatched, so every remaining pair
        // involves a hypothesis without a match and stays single-turn.
        let second = f.tournament.schedule_matches().await.unwrap();
        assert_eq!(second[0].debate_depth, DebateDepth::SingleTurn);
    }

    #[tokio::test]
    async fn test_excluded_hypotheses_are_not_scheduled() {
        let f = fixture(TournamentConfig::default());
        let hs = seed(&f.registry, 3).await;
        f.registry
            .set_status(hs[0].id, crate::domain::models::HypothesisStatus::ExcludedForSafety)
            .await
            .unwrap();

        let scheduled = f.tournament.schedule_matches().await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert!(!scheduled[0].involves(hs[0].id));
    }

    #[tokio::test]
    async fn test_halt_stops_scheduling() {
        let f = fixture(TournamentConfig::default());
        seed(&f.registry, 3).await;
        f.tournament.halt();
        assert!(f.tournament.schedule_matches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_frees_slot_but_keeps_pair() {
        let f = fixture(TournamentConfig {
            max_pending_matches: 1,
            ..TournamentConfig::default()
        });
        seed(&f.registry, 2).await;
        let m = f.tournament.schedule_matches().await.unwrap().remove(0);

        f.tournament.abandon_match(m.id).await.unwrap();
        let book = f.tournament.pairing_book().await.unwrap();
        assert!(book.open_matches.is_empty());
        assert!(book.scheduled.contains(&m.pair_key()));
        assert!(f.tournament.schedule_matches().await.unwrap().is_empty());
    }

    #[test]
    fn test_standings_order() {
        let old = Hypothesis::new(json!("old"), "t");
        let mut young = Hypothesis::new(json!("young"), "t");
        young.created_at = old.created_at + chrono::Duration::seconds(1);
        let busy = Hypothesis::new(json!("busy"), "t");
        let best = Hypothesis::new(json!("best"), "t");

        let mut ledger = RatingLedger::default();
        for h in [&old, &young] {
            ledger.ratings.insert(h.id, Rating::new(1200.0));
        }
        let mut busy_rating = Rating::new(1200.0);
        busy_rating.record(MatchResult::Draw, 0.0);
        ledger.ratings.insert(busy.id, busy_rating);
        let mut best_rating = Rating::new(1200.0);
        best_rating.record(MatchResult::Win, 16.0);
        ledger.ratings.insert(best.id, best_rating);

        let standings = build_standings(
            vec![young.clone(), old.clone(), busy.clone(), best.clone()],
            &ledger,
            1200.0,
        );
        let order: Vec<Uuid> = standings.iter().map(|s| s.hypothesis.id).collect();
        assert_eq!(order, vec![best.id, busy.id, old.id, young.id]);
        assert_eq!(standings[0].rank, 1);
    }

    /// Fails every write to a match record while `down` is set.
    #[derive(Default)]
    struct MatchStoreOutage {
        inner: InMemoryContextStore,
        down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ContextStore for MatchStoreOutage {
        async fn get(&self, key: &str) -> DomainResult<Option<ContextEntry>> {
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected_version: u64,
            value: serde_json::Value,
        ) -> DomainResult<CasOutcome> {
            if self.down.load(Ordering::SeqCst) && key.starts_with("tournament/matches/") {
                return Err(DomainError::StorageUnavailable("disk detached".to_string()));
            }
            self.inner.compare_and_set(key, expected_version, value).await
        }

        async fn list_keys(&self, prefix: &str) -> DomainResult<Vec<String>> {
            self.inner.list_keys(prefix).await
        }

        async fn snapshot(&self) -> DomainResult<Vec<ContextEntry>> {
            self.inner.snapshot().await
        }

        async fn restore(&self, entries: Vec<ContextEntry>) -> DomainResult<()> {
            self.inner.restore(entries).await
        }
    }

    #[tokio::test]
    async fn test_failed_match_write_gives_back_reservation() {
        let store = Arc::new(MatchStoreOutage::default());
        let retry = RetryConfig {
            storage_initial_backoff_ms: 1,
            storage_max_backoff_ms: 2,
            storage_max_elapsed_ms: 20,
            ..RetryConfig::default()
        };
        let memory = ContextMemory::new(store.clone(), &retry);
        let queue = Arc::new(TaskQueue::new(QueueConfig::default(), retry));
        let config = TournamentConfig {
            max_pending_matches: 1,
            ..TournamentConfig::default()
        };
        let tournament = Tournament::with_seed(memory.clone(), queue.clone(), config, 7);
        seed(&HypothesisRegistry::new(memory), 2).await;

        store.down.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            let err = tournament.schedule_matches().await.unwrap_err();
            assert!(matches!(err, DomainError::StorageUnavailable(_)));
        }
        let progress = tournament.progress().await.unwrap();
        assert_eq!(progress.open_matches, 0);
        assert_eq!(progress.scheduled_pairs, 0);
        assert_eq!(queue.active_count().await, 0);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(tournament.schedule_matches().await.unwrap().len(), 1);
        assert_eq!(queue.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_match_task_gives_back_reservation() {
        let memory = ContextMemory::new(Arc::new(InMemoryContextStore::new()), &RetryConfig::default());
        let queue = Arc::new(TaskQueue::new(
            QueueConfig {
                max_size: 0,
                ..QueueConfig::default()
            },
            RetryConfig::default(),
        ));
        let tournament = Tournament::with_seed(memory.clone(), queue, TournamentConfig::default(), 7);
        seed(&HypothesisRegistry::new(memory), 3).await;

        assert!(tournament.schedule_matches().await.unwrap().is_empty());
        let progress = tournament.progress().await.unwrap();
        assert_eq!(progress.open_matches, 0);
        assert_eq!(progress.scheduled_pairs, 0);
    }
}
