use crate::formula::MolecularFormula;
use crate::input::{ProcessedInput, ProcessedPeak};

use super::{DecompositionScorer, ScoreType};

/// Log-likelihood of the mass error of a formula under a zero-centered normal error
/// model, relative to an exact match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassDeviationScorer {
    /// The standard deviation of the mass error, in parts-per-million
    pub standard_deviation: f64,
}

impl Default for MassDeviationScorer {
    fn default() -> Self {
        Self {
            standard_deviation: 3.0,
        }
    }
}

impl MassDeviationScorer {
    pub fn new(standard_deviation: f64) -> Self {
        Self { standard_deviation }
    }
}

impl DecompositionScorer for MassDeviationScorer {
    type Prepared = ();

    fn prepare(&self, _input: &ProcessedInput) -> Self::Prepared {}

    fn score(
        &self,
        formula: &MolecularFormula,
        peak: &ProcessedPeak,
        _input: &ProcessedInput,
        _prepared: &Self::Prepared,
    ) -> ScoreType {
        let theoretical = formula.mass();
        if theoretical <= 0.0 {
            return 0.0;
        }
        let ppm = (peak.mass() - theoretical) / theoretical * 1e6;
        let z = ppm / self.standard_deviation;
        -0.5 * z * z
    }
}

/// Penalizes formulas with more hetero atoms per carbon than is chemically common
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeteroAtomRatioScorer {
    /// Ratios at or below this value are not penalized
    pub expected_ratio: f64,
    pub standard_deviation: f64,
}

impl Default for HeteroAtomRatioScorer {
    fn default() -> Self {
        Self {
            expected_ratio: 1.0,
            standard_deviation: 0.5,
        }
    }
}

impl DecompositionScorer for HeteroAtomRatioScorer {
    type Prepared = ();

    fn prepare(&self, _input: &ProcessedInput) -> Self::Prepared {}

    fn score(
        &self,
        formula: &MolecularFormula,
        _peak: &ProcessedPeak,
        _input: &ProcessedInput,
        _prepared: &Self::Prepared,
    ) -> ScoreType {
        let carbons = formula.count_of("C").max(1) as f64;
        let ratio = formula.hetero_atom_count() as f64 / carbons;
        if ratio <= self.expected_ratio {
            0.0
        } else {
            let z = (ratio - self.expected_ratio) / self.standard_deviation;
            -0.5 * z * z
        }
    }
}

/// Rewards explaining intense peaks, proportional to their intensity relative to the
/// most intense fragment peak of the spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelativeIntensityScorer {
    pub weight: f64,
}

impl Default for RelativeIntensityScorer {
    fn default() -> Self {
        Self { weight: 1.0 }
    }
}

impl DecompositionScorer for RelativeIntensityScorer {
    /// The maximum intensity over all peaks but the parent
    type Prepared = f32;

    fn prepare(&self, input: &ProcessedInput) -> Self::Prepared {
        input
            .peaks
            .iter()
            .filter(|p| p.index != input.parent_peak)
            .map(|p| p.intensity)
            .fold(0.0, f32::max)
    }

    fn score(
        &self,
        _formula: &MolecularFormula,
        peak: &ProcessedPeak,
        _input: &ProcessedInput,
        prepared: &Self::Prepared,
    ) -> ScoreType {
        if *prepared <= 0.0 {
            0.0
        } else {
            self.weight * (peak.intensity / *prepared).min(1.0) as f64
        }
    }
}
