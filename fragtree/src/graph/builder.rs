use std::sync::Arc;

use tracing::debug;

use crate::formula::ScoredMolecularFormula;
use crate::input::ProcessedInput;

use super::{FragmentationGraph, ROOT};

/// Builds the unscored fragmentation graph of a precursor candidate
pub trait GraphBuilder: Send + Sync + std::fmt::Debug {
    fn build_graph(
        &self,
        input: &Arc<ProcessedInput>,
        candidate: &ScoredMolecularFormula,
    ) -> FragmentationGraph;
}

/// Connects two fragments whenever the child is lighter than the parent and its formula
/// is contained in the parent's formula.
///
/// Every decomposition of every non-parent peak that fits inside the candidate becomes
/// a vertex. Vertices are added heaviest peak first, so every edge points from a lower
/// vertex index to a higher one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubFormulaGraphBuilder;

impl GraphBuilder for SubFormulaGraphBuilder {
    #[tracing::instrument(level = "debug", skip_all, fields(candidate = %candidate.formula))]
    fn build_graph(
        &self,
        input: &Arc<ProcessedInput>,
        candidate: &ScoredMolecularFormula,
    ) -> FragmentationGraph {
        let mut graph = FragmentationGraph::new(input.clone(), candidate.clone());

        let mut peak_order: Vec<usize> = (0..input.peaks.len())
            .filter(|i| *i != input.parent_peak)
            .collect();
        peak_order.sort_by(|a, b| {
            input.peaks[*b]
                .mass()
                .total_cmp(&input.peaks[*a].mass())
                .then(a.cmp(b))
        });

        let mut masses = vec![input.peak(input.parent_peak).mass()];
        for peak_index in peak_order {
            let peak = input.peak(peak_index);
            for decomposition in peak.decompositions.iter() {
                if !candidate.formula.contains(&decomposition.formula) {
                    continue;
                }
                graph.add_fragment(peak_index, decomposition.clone());
                masses.push(peak.mass());
            }
        }

        let n = graph.number_of_vertices();
        for head in ROOT..n {
            for tail in (head + 1)..n {
                if masses[head] <= masses[tail] {
                    continue;
                }
                let (parent, child) = (graph.fragment(head), graph.fragment(tail));
                if parent.peak == child.peak {
                    continue;
                }
                if let Some(loss) = parent.formula().checked_sub(child.formula()) {
                    if !loss.is_empty() {
                        graph.add_loss(head, tail, loss);
                    }
                }
            }
        }
        debug!(
            "Built graph with {} vertices and {} edges",
            graph.number_of_vertices(),
            graph.number_of_edges()
        );
        graph
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formula::MolecularFormula;
    use crate::input::{ExperimentInfo, Ionization, ProcessedPeak};

    fn f(s: &str) -> MolecularFormula {
        s.parse().unwrap()
    }

    fn peak_for(index: usize, formulas: &[&str]) -> ProcessedPeak {
        let ionization = Ionization::protonated();
        let mz = ionization.mz(f(formulas[0]).mass());
        ProcessedPeak::new(index, mz, 100.0)
            .with_decompositions(formulas.iter().map(|s| f(s).into()).collect())
    }

    #[test]
    fn test_sub_formula_edges() {
        let peaks = vec![
            peak_for(0, &["C2H4"]),
            peak_for(1, &["C5H12O5", "C6H8O4"]),
            peak_for(2, &["C6H12O6"]),
        ];
        let input = Arc::new(ProcessedInput::new(
            ExperimentInfo::default(),
            peaks,
            2,
            vec![f("C6H12O6").into()],
        ));
        let graph = SubFormulaGraphBuilder.build_graph(&input, &input.parent_candidates[0]);
        assert_eq!(graph.number_of_vertices(), 4);
        assert_eq!(graph.root().formula(), &f("C6H12O6"));
        for loss in graph.losses() {
            assert!(loss.head < loss.tail);
            assert!(!loss.formula.is_empty());
            let head = graph.fragment(loss.head);
            let tail = graph.fragment(loss.tail);
            assert_ne!(head.peak, tail.peak);
            assert_eq!(tail.formula().add(&loss.formula), *head.formula());
        }
        // root -> both decompositions of peak 1, root -> C2H4, C5H12O5 -> C2H4, C6H8O4 -> C2H4
        assert_eq!(graph.number_of_edges(), 5);
        assert_eq!(graph.check_invariants(), Ok(()));
    }

    #[test]
    fn test_excludes_formulas_outside_candidate() {
        let peaks = vec![peak_for(0, &["C2H3N"]), peak_for(1, &["C6H12O6"])];
        let input = Arc::new(ProcessedInput::new(
            ExperimentInfo::default(),
            peaks,
            1,
            vec![f("C6H12O6").into()],
        ));
        let graph = SubFormulaGraphBuilder.build_graph(&input, &input.parent_candidates[0]);
        assert_eq!(graph.number_of_vertices(), 1);
        assert_eq!(graph.number_of_edges(), 0);
    }
}
