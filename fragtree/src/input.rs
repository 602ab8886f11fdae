//! The preprocessed spectrum a fragmentation tree is computed for.
use chemical_elements::{neutral_mass, PROTON};
use mzpeaks::Tolerance;

use crate::formula::ScoredMolecularFormula;
use crate::scoring::ScoreType;

/// How peaks were charged. Only the charge carrier's mass and the charge state
/// are needed to recover neutral masses.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ionization {
    pub charge: i32,
    pub carrier_mass: f64,
}

impl Default for Ionization {
    fn default() -> Self {
        Self::protonated()
    }
}

impl Ionization {
    pub fn new(charge: i32, carrier_mass: f64) -> Self {
        Self {
            charge,
            carrier_mass,
        }
    }

    pub fn protonated() -> Self {
        Self::new(1, PROTON)
    }

    pub fn neutral_mass(&self, mz: f64) -> f64 {
        neutral_mass(mz, self.charge, self.carrier_mass)
    }

    pub fn mz(&self, neutral: f64) -> f64 {
        let z = self.charge.abs().max(1) as f64;
        (neutral + self.carrier_mass * self.charge as f64) / z
    }
}

/// The range of collision energies a peak was observed at
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CollisionEnergy {
    pub min: f64,
    pub max: f64,
}

impl CollisionEnergy {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// A merged, normalized fragment peak together with its candidate formulas
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessedPeak {
    #[cfg_attr(feature = "serde", serde(default))]
    pub index: usize,
    pub mz: f64,
    pub intensity: f32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub relative_intensity: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub ionization: Ionization,
    #[cfg_attr(feature = "serde", serde(default))]
    pub decompositions: Vec<ScoredMolecularFormula>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub collision_energy: Option<CollisionEnergy>,
}

impl ProcessedPeak {
    pub fn new(index: usize, mz: f64, intensity: f32) -> Self {
        Self {
            index,
            mz,
            intensity,
            ..Default::default()
        }
    }

    pub fn with_decompositions(mut self, decompositions: Vec<ScoredMolecularFormula>) -> Self {
        self.decompositions = decompositions;
        self
    }

    pub fn with_collision_energy(mut self, collision_energy: CollisionEnergy) -> Self {
        self.collision_energy = Some(collision_energy);
        self
    }

    /// The neutral mass of the peak under its ionization
    pub fn mass(&self) -> f64 {
        self.ionization.neutral_mass(self.mz)
    }
}

/// Acquisition facts shared by every peak of a spectrum
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExperimentInfo {
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: Option<String>,
    pub precursor_mz: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub ionization: Ionization,
    /// Fragment mass accuracy in parts-per-million
    pub ms2_ppm: f64,
    /// Precursor mass accuracy in parts-per-million
    pub ms1_ppm: f64,
}

impl Default for ExperimentInfo {
    fn default() -> Self {
        Self {
            name: None,
            precursor_mz: 0.0,
            ionization: Ionization::default(),
            ms2_ppm: 10.0,
            ms1_ppm: 5.0,
        }
    }
}

impl ExperimentInfo {
    pub fn fragment_tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.ms2_ppm)
    }

    pub fn precursor_tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.ms1_ppm)
    }

    pub fn precursor_mass(&self) -> f64 {
        self.ionization.neutral_mass(self.precursor_mz)
    }
}

/// A spectrum ready for graph construction: normalized peaks, the index of the
/// parent peak, and the ranked precursor formula candidates.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessedInput {
    pub experiment: ExperimentInfo,
    pub peaks: Vec<ProcessedPeak>,
    pub parent_peak: usize,
    #[cfg_attr(feature = "serde", serde(default))]
    pub parent_candidates: Vec<ScoredMolecularFormula>,
}

impl ProcessedInput {
    pub fn new(
        experiment: ExperimentInfo,
        peaks: Vec<ProcessedPeak>,
        parent_peak: usize,
        parent_candidates: Vec<ScoredMolecularFormula>,
    ) -> Self {
        let mut this = Self {
            experiment,
            peaks,
            parent_peak,
            parent_candidates,
        };
        this.normalize();
        this
    }

    /// Re-establish the invariants consumers rely on: peak indices match their
    /// positions, relative intensities are scaled to the most intense peak, and parent
    /// candidates are ordered by descending score with no non-finite tail.
    pub fn normalize(&mut self) {
        let max_intensity = self
            .peaks
            .iter()
            .map(|p| p.intensity)
            .fold(0.0f32, f32::max);
        for (i, peak) in self.peaks.iter_mut().enumerate() {
            peak.index = i;
            if max_intensity > 0.0 {
                peak.relative_intensity = (peak.intensity / max_intensity) as f64;
            }
        }
        self.parent_candidates
            .sort_by(|a, b| b.score.total_cmp(&a.score));
        let finite = self
            .parent_candidates
            .iter()
            .take_while(|c| c.score.is_finite())
            .count();
        self.parent_candidates.truncate(finite);
    }

    pub fn parent(&self) -> Option<&ProcessedPeak> {
        self.peaks.get(self.parent_peak)
    }

    pub fn peak(&self, index: usize) -> &ProcessedPeak {
        &self.peaks[index]
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn best_candidate_score(&self) -> Option<ScoreType> {
        self.parent_candidates.first().map(|c| c.score)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize() {
        let peaks = vec![
            ProcessedPeak::new(7, 100.0, 50.0),
            ProcessedPeak::new(3, 181.07, 200.0),
        ];
        let candidates = vec![
            ScoredMolecularFormula::new("C6H12O6".parse().unwrap(), 1.0),
            ScoredMolecularFormula::new("C7H16O5".parse().unwrap(), f64::NEG_INFINITY),
            ScoredMolecularFormula::new("C5H8N4O3".parse().unwrap(), 3.0),
        ];
        let input = ProcessedInput::new(ExperimentInfo::default(), peaks, 1, candidates);
        assert_eq!(input.peaks[0].index, 0);
        assert_eq!(input.peaks[1].index, 1);
        assert_eq!(input.peaks[0].relative_intensity, 0.25);
        assert_eq!(input.parent_candidates.len(), 2);
        assert_eq!(input.best_candidate_score(), Some(3.0));
        assert_eq!(input.parent().unwrap().mz, 181.07);
    }

    #[test]
    fn test_neutral_mass() {
        let ionization = Ionization::protonated();
        let peak = ProcessedPeak::new(0, 181.0707, 1.0);
        let mass = peak.mass();
        assert!((mass - (181.0707 - PROTON)).abs() < 1e-9);
        assert!((ionization.mz(mass) - 181.0707).abs() < 1e-9);
    }

    #[test]
    fn test_tolerances() {
        let info = ExperimentInfo {
            ms1_ppm: 5.0,
            ms2_ppm: 10.0,
            ..Default::default()
        };
        assert!(matches!(info.precursor_tolerance(), Tolerance::PPM(t) if t == 5.0));
        assert!(matches!(info.fragment_tolerance(), Tolerance::PPM(t) if t == 10.0));
        let (low, high) = info.fragment_tolerance().bounds(1000.0);
        assert!((high - low - 0.02).abs() < 1e-9);
    }
}
