//! Mass recalibration from the fragments a tree explains.
//!
//! The explained fragments of a good tree are a set of peaks with known formulas, so
//! their mass errors estimate the systematic shift of the spectrum. A spectrum whose
//! peaks are corrected by that shift can produce a better tree on a second pass.
use tracing::debug;

use crate::input::ProcessedInput;
use crate::tree::FragmentationTree;

/// Trees explaining fewer fragments than this are not used to estimate a shift
pub const MIN_RECALIBRATION_FRAGMENTS: usize = 3;

/// Shifts smaller than this in ppm are not worth a second pass
pub const MIN_RECALIBRATION_SHIFT: f64 = 0.1;

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// The median signed ppm error of the fragments of `tree`, or `None` when the tree
/// explains too few fragments or the shift is negligible.
pub fn estimate_shift_ppm(input: &ProcessedInput, tree: &FragmentationTree) -> Option<f64> {
    let mut errors: Vec<f64> = tree
        .fragments()
        .iter()
        .filter(|f| !f.is_root())
        .filter_map(|f| {
            let theoretical = f.formula.mass();
            let peak = input.peaks.get(f.peak)?;
            (theoretical > 0.0).then(|| (peak.mass() - theoretical) / theoretical * 1e6)
        })
        .collect();
    if errors.len() < MIN_RECALIBRATION_FRAGMENTS {
        return None;
    }
    let shift = median(&mut errors)?;
    debug!(
        "Estimated a shift of {shift:0.3} ppm from {} fragments of {}",
        errors.len(),
        tree.candidate.formula
    );
    (shift.abs() > MIN_RECALIBRATION_SHIFT).then_some(shift)
}

/// A copy of `input` with every m/z, the precursor's included, corrected by
/// `shift_ppm`.
pub fn recalibrated_input(input: &ProcessedInput, shift_ppm: f64) -> ProcessedInput {
    let factor = 1.0 + shift_ppm * 1e-6;
    let mut recalibrated = input.clone();
    for peak in recalibrated.peaks.iter_mut() {
        let mass = peak.mass() / factor;
        peak.mz = peak.ionization.mz(mass);
    }
    let precursor = recalibrated.experiment.precursor_mass() / factor;
    recalibrated.experiment.precursor_mz = recalibrated.experiment.ionization.mz(precursor);
    recalibrated
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formula::MolecularFormula;
    use crate::input::{Ionization, ProcessedPeak};

    fn f(s: &str) -> MolecularFormula {
        s.parse().unwrap()
    }

    fn shifted_input(formulas: &[&str], ppm: f64) -> ProcessedInput {
        let ionization = Ionization::default();
        let peaks = formulas
            .iter()
            .enumerate()
            .map(|(i, s)| ProcessedPeak::new(i, ionization.mz(f(s).mass() * (1.0 + ppm * 1e-6)), 1.0))
            .collect();
        ProcessedInput::new(Default::default(), peaks, formulas.len() - 1, vec![])
    }

    #[test]
    fn test_estimate_and_correct() {
        let formulas = ["C2H4O2", "C3H6O3", "C4H8O4", "C6H12O6"];
        let input = shifted_input(&formulas, 4.0);
        let mut tree = FragmentationTree::new(f("C6H12O6").into(), 3, 0.0);
        let a = tree.add_fragment(0, f("C4H8O4"), 2, 1, f("C2H4O2"), 1.0);
        tree.add_fragment(a, f("C3H6O3"), 1, 2, f("CH2O"), 1.0);
        tree.add_fragment(0, f("C2H4O2"), 0, 3, f("C4H8O4"), 1.0);

        let shift = estimate_shift_ppm(&input, &tree).unwrap();
        assert!((shift - 4.0).abs() < 1e-6, "{shift}");

        let corrected = recalibrated_input(&input, shift);
        for (peak, formula) in corrected.peaks.iter().zip(formulas) {
            let error = (peak.mass() - f(formula).mass()) / f(formula).mass() * 1e6;
            assert!(error.abs() < 1e-6, "{error}");
        }
        assert!(estimate_shift_ppm(&corrected, &tree).is_none());
    }

    #[test]
    fn test_too_few_fragments() {
        let input = shifted_input(&["C2H4O2", "C6H12O6"], 4.0);
        let mut tree = FragmentationTree::new(f("C6H12O6").into(), 1, 0.0);
        tree.add_fragment(0, f("C2H4O2"), 0, 1, f("C4H8O4"), 1.0);
        assert!(estimate_shift_ppm(&input, &tree).is_none());
    }
}
