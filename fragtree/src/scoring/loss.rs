use std::collections::HashMap;

use crate::formula::MolecularFormula;
use crate::graph::{FragmentationGraph, Loss};
use crate::input::ProcessedInput;

use super::{LossScorer, ScoreType};

const COMMON_LOSSES: &[(&str, ScoreType)] = &[
    ("H2O", 1.5),
    ("CO", 1.2),
    ("CO2", 1.2),
    ("NH3", 1.0),
    ("CH2O2", 1.0),
    ("C2H4", 0.8),
    ("CH4O", 0.8),
    ("CH2O", 0.7),
    ("HCN", 0.7),
    ("C2H2O", 0.6),
    ("H3PO4", 0.6),
    ("C2H4O2", 0.5),
    ("SO3", 0.5),
    ("CH3", 0.3),
    ("CH4", 0.3),
];

/// Adds a log-odds bonus for losses that frequently occur in fragmentation spectra
#[derive(Debug, Clone, PartialEq)]
pub struct CommonLossScorer {
    pub losses: HashMap<MolecularFormula, ScoreType>,
    /// The score given to a loss which is not in the table
    pub normalization: ScoreType,
}

impl CommonLossScorer {
    pub fn new(losses: HashMap<MolecularFormula, ScoreType>, normalization: ScoreType) -> Self {
        Self {
            losses,
            normalization,
        }
    }

    pub fn score_of(&self, formula: &MolecularFormula) -> ScoreType {
        self.losses
            .get(formula)
            .copied()
            .unwrap_or(self.normalization)
    }
}

impl Default for CommonLossScorer {
    fn default() -> Self {
        let losses = COMMON_LOSSES
            .iter()
            .filter_map(|(f, s)| f.parse().ok().map(|f: MolecularFormula| (f, *s)))
            .collect();
        Self::new(losses, 0.0)
    }
}

impl LossScorer for CommonLossScorer {
    type Prepared = ();

    fn prepare(&self, _input: &ProcessedInput) -> Self::Prepared {}

    fn score(
        &self,
        loss: &Loss,
        _graph: &FragmentationGraph,
        _input: &ProcessedInput,
        _prepared: &Self::Prepared,
    ) -> ScoreType {
        self.score_of(&loss.formula)
    }
}

/// Penalizes losses of radicals, except for a small set that is routinely observed
#[derive(Debug, Clone, PartialEq)]
pub struct FreeRadicalLossScorer {
    pub penalty: ScoreType,
    pub allowed: Vec<MolecularFormula>,
}

impl Default for FreeRadicalLossScorer {
    fn default() -> Self {
        let allowed = ["H", "CH3", "OH", "Cl", "Br", "I", "NO", "NO2"]
            .iter()
            .filter_map(|f| f.parse().ok())
            .collect();
        Self {
            penalty: -2.3,
            allowed,
        }
    }
}

impl LossScorer for FreeRadicalLossScorer {
    type Prepared = ();

    fn prepare(&self, _input: &ProcessedInput) -> Self::Prepared {}

    fn score(
        &self,
        loss: &Loss,
        _graph: &FragmentationGraph,
        _input: &ProcessedInput,
        _prepared: &Self::Prepared,
    ) -> ScoreType {
        if loss.formula.is_radical() && !self.allowed.contains(&loss.formula) {
            self.penalty
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_common_losses() {
        let scorer = CommonLossScorer::default();
        assert_eq!(scorer.score_of(&"H2O".parse().unwrap()), 1.5);
        assert_eq!(scorer.score_of(&"C3H8O5".parse().unwrap()), 0.0);
        assert_eq!(scorer.losses.len(), COMMON_LOSSES.len());
    }

    #[test]
    fn test_radicals() {
        let scorer = FreeRadicalLossScorer::default();
        let methyl: MolecularFormula = "CH3".parse().unwrap();
        let ethyl: MolecularFormula = "C2H5".parse().unwrap();
        assert!(ethyl.is_radical());
        assert!(scorer.allowed.contains(&methyl));
        assert!(!scorer.allowed.contains(&ethyl));
    }
}
