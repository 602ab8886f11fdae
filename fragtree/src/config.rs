//! Immutable configuration of a fragmentation pattern analysis.
//!
//! An [`AnalysisConfig`] is built once and handed to
//! [`FragmentationPatternAnalysis`](crate::analysis::FragmentationPatternAnalysis),
//! which derives its scorers, tree builder and decomposer cache from it.
use std::fmt::Display;
use std::str::FromStr;

use crate::decomposer::{MassDecomposer, DEFAULT_CACHE_CAPACITY};
use crate::scoring::{
    CollisionEnergyPeakPairScorer, CommonLossScorer, FreeRadicalLossScorer, GraphScoring,
    HeteroAtomRatioScorer, LossSizePeakPairScorer, MassDeviationScorer, RelativeIntensityScorer,
    ScoreType,
};
use crate::tree_builder::{DPTreeBuilder, GreedyTreeBuilder, TreeBuilder};

/// Which scorers take part in edge weights, and their parameters. A `None` disables
/// the corresponding scorer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct ScoringConfig {
    /// Standard deviation in ppm of fragment and precursor mass errors
    pub mass_deviation: Option<f64>,
    /// Hetero atom to carbon ratio above which formulas are penalized
    pub hetero_atom_ratio: Option<f64>,
    pub intensity_weight: Option<f64>,
    pub common_losses: bool,
    pub radical_loss_penalty: Option<ScoreType>,
    /// Mean and standard deviation of the logarithm of loss masses
    pub loss_size: Option<(f64, f64)>,
    pub collision_energy_penalty: Option<ScoreType>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            mass_deviation: Some(3.0),
            hetero_atom_ratio: Some(1.0),
            intensity_weight: Some(1.0),
            common_losses: true,
            radical_loss_penalty: Some(FreeRadicalLossScorer::default().penalty),
            loss_size: Some((4.0, 1.0)),
            collision_energy_penalty: None,
        }
    }
}

impl ScoringConfig {
    pub fn build(&self) -> GraphScoring {
        let mut scoring = GraphScoring::new();
        if let Some(sd) = self.mass_deviation {
            scoring = scoring
                .with_root_scorer(MassDeviationScorer::new(sd))
                .with_decomposition_scorer(MassDeviationScorer::new(sd));
        }
        if let Some(ratio) = self.hetero_atom_ratio {
            let scorer = HeteroAtomRatioScorer {
                expected_ratio: ratio,
                ..Default::default()
            };
            scoring = scoring
                .with_root_scorer(scorer)
                .with_decomposition_scorer(scorer);
        }
        if let Some(weight) = self.intensity_weight {
            scoring = scoring.with_decomposition_scorer(RelativeIntensityScorer { weight });
        }
        if self.common_losses {
            scoring = scoring.with_loss_scorer(CommonLossScorer::default());
        }
        if let Some(penalty) = self.radical_loss_penalty {
            scoring = scoring.with_loss_scorer(FreeRadicalLossScorer {
                penalty,
                ..Default::default()
            });
        }
        if let Some((log_mean, log_standard_deviation)) = self.loss_size {
            scoring = scoring.with_peak_pair_scorer(LossSizePeakPairScorer {
                log_mean,
                log_standard_deviation,
            });
        }
        if let Some(penalty) = self.collision_energy_penalty {
            scoring = scoring.with_peak_pair_scorer(CollisionEnergyPeakPairScorer { penalty });
        }
        scoring
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum TreeBuilderKind {
    #[default]
    Exact,
    Greedy,
}

impl Display for TreeBuilderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeBuilderKind::Exact => f.write_str("exact"),
            TreeBuilderKind::Greedy => f.write_str("greedy"),
        }
    }
}

impl FromStr for TreeBuilderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" | "dp" => Ok(Self::Exact),
            "greedy" => Ok(Self::Greedy),
            _ => Err(format!("Unknown tree builder {s:?}, expected \"exact\" or \"greedy\"")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct AnalysisConfig {
    /// The number of initialized decomposers kept by the analysis
    pub decomposer_cache_size: usize,
    pub max_atoms: i32,
    pub min_rdbe: Option<f64>,
    pub scoring: ScoringConfig,
    pub tree_builder: TreeBuilderKind,
    /// The number of best-ranked colors the exact tree builder searches over, at most
    /// [`MAX_EXACT_COLORS`](crate::tree_builder::MAX_EXACT_COLORS)
    pub max_colors: usize,
    /// Reduce every graph to this many non-root colors before tree computation
    pub retain_peaks: Option<usize>,
    pub threads: usize,
    /// Bytes of memory the multithreaded search may assume are available
    pub memory_budget: Option<u64>,
    pub lowerbound: ScoreType,
    pub max_trees: usize,
    pub recalibration: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            decomposer_cache_size: DEFAULT_CACHE_CAPACITY,
            max_atoms: MassDecomposer::default().max_atoms,
            min_rdbe: MassDecomposer::default().min_rdbe,
            scoring: ScoringConfig::default(),
            tree_builder: TreeBuilderKind::default(),
            max_colors: DPTreeBuilder::default().max_colors,
            retain_peaks: None,
            threads: 1,
            memory_budget: None,
            lowerbound: 0.0,
            max_trees: 5,
            recalibration: false,
        }
    }
}

impl AnalysisConfig {
    pub fn build_tree_builder(&self) -> Box<dyn TreeBuilder> {
        match self.tree_builder {
            TreeBuilderKind::Exact => Box::new(DPTreeBuilder::new(self.max_colors)),
            TreeBuilderKind::Greedy => Box::new(GreedyTreeBuilder),
        }
    }

    pub fn build_decomposer(&self) -> MassDecomposer {
        MassDecomposer {
            min_rdbe: self.min_rdbe,
            max_atoms: self.max_atoms,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AnalysisConfig::default();
        assert_eq!(config.build_tree_builder().description(), "dynamic programming");
        assert!(!config.scoring.build().is_empty());
        let empty = ScoringConfig {
            mass_deviation: None,
            hetero_atom_ratio: None,
            intensity_weight: None,
            common_losses: false,
            radical_loss_penalty: None,
            loss_size: None,
            collision_energy_penalty: None,
        };
        assert!(empty.build().is_empty());
    }

    #[test]
    fn test_builder_kind() {
        assert_eq!("greedy".parse::<TreeBuilderKind>(), Ok(TreeBuilderKind::Greedy));
        assert_eq!("DP".parse::<TreeBuilderKind>(), Ok(TreeBuilderKind::Exact));
        assert!("ilp".parse::<TreeBuilderKind>().is_err());
        assert_eq!(TreeBuilderKind::Greedy.to_string(), "greedy");
    }
}
