use crate::domain::models::MatchResult;

/// Standard Elo rating arithmetic.
///
/// `expected = 1 / (1 + 10^((other - rating) / 400))` and
/// `new = old + K * (actual - expected)`. Updates are zero-sum: the second
/// participant always receives exactly the negation of the first's change.
#[derive(Debug, Clone, Copy)]
pub struct EloCalculator {
    k_factor: f64,
}

impl Default for EloCalculator {
    fn default() -> Self {
        Self::new(32.0)
    }
}

impl EloCalculator {
    pub fn new(k_factor: f64) -> Self {
        Self { k_factor }
    }

    pub fn k_factor(&self) -> f64 {
        self.k_factor
    }

    /// Probability-like expected score of `rating` against `other`.
    pub fn expected_score(rating: f64, other: f64) -> f64 {
        1.0 / (1.0 + 10f64.powf((other - rating) / 400.0))
    }

    /// Rating change for A given A's result against B. B's change is the
    /// negation.
    pub fn rating_delta(&self, rating_a: f64, rating_b: f64, result_a: MatchResult) -> f64 {
        self.k_factor * (result_a.score() - Self::expected_score(rating_a, rating_b))
    }

    /// New ratings for both participants.
    pub fn apply(&self, rating_a: f64, rating_b: f64, result_a: MatchResult) -> (f64, f64) {
        let delta = self.rating_delta(rating_a, rating_b, result_a);
        (rating_a + delta, rating_b - delta)
    }
}
