use crate::input::{ProcessedInput, ProcessedPeak};

use super::{PeakPairScorer, ScoreType};

/// Log-normal log-likelihood of the mass gap between two peaks, relative to the mode
/// of the distribution. Small and very large losses are penalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSizePeakPairScorer {
    /// Mean of the logarithm of the loss mass
    pub log_mean: f64,
    /// Standard deviation of the logarithm of the loss mass
    pub log_standard_deviation: f64,
}

impl Default for LossSizePeakPairScorer {
    fn default() -> Self {
        Self {
            log_mean: 4.0,
            log_standard_deviation: 1.0,
        }
    }
}

impl LossSizePeakPairScorer {
    pub fn score_gap(&self, gap: f64) -> ScoreType {
        if gap <= 0.0 {
            return 0.0;
        }
        let s2 = self.log_standard_deviation * self.log_standard_deviation;
        let mode = (self.log_mean - s2).exp();
        let log_density = |x: f64| {
            let z = (x.ln() - self.log_mean) / self.log_standard_deviation;
            -x.ln() - 0.5 * z * z
        };
        log_density(gap) - log_density(mode)
    }
}

impl PeakPairScorer for LossSizePeakPairScorer {
    fn score(&self, peaks: &[ProcessedPeak], _input: &ProcessedInput, scores: &mut [Vec<ScoreType>]) {
        for (i, parent) in peaks.iter().enumerate() {
            let parent_mass = parent.mass();
            for (j, child) in peaks.iter().enumerate() {
                let gap = parent_mass - child.mass();
                if gap > 0.0 {
                    scores[i][j] += self.score_gap(gap);
                }
            }
        }
    }
}

/// Penalizes a child peak whose lowest observed collision energy is below the lowest
/// collision energy of its parent: a fragment should not appear before its precursor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionEnergyPeakPairScorer {
    pub penalty: ScoreType,
}

impl Default for CollisionEnergyPeakPairScorer {
    fn default() -> Self {
        Self {
            penalty: (0.1f64).ln(),
        }
    }
}

impl PeakPairScorer for CollisionEnergyPeakPairScorer {
    fn score(&self, peaks: &[ProcessedPeak], input: &ProcessedInput, scores: &mut [Vec<ScoreType>]) {
        for (i, parent) in peaks.iter().enumerate() {
            if i == input.parent_peak {
                continue;
            }
            let Some(parent_energy) = parent.collision_energy else {
                continue;
            };
            for (j, child) in peaks.iter().enumerate() {
                if let Some(child_energy) = child.collision_energy {
                    if child_energy.min < parent_energy.min {
                        scores[i][j] += self.penalty;
                    }
                }
            }
        }
    }
}
