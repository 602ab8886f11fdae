//! The entry points of a fragmentation pattern analysis: build and score the graph of a
//! precursor candidate, then select its best tree.
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::AnalysisConfig;
use crate::decomposer::{DecomposerCache, MassDecomposer};
use crate::formula::{ChemicalAlphabet, ScoredMolecularFormula};
use crate::graph::{FragmentationGraph, GraphBuilder, SubFormulaGraphBuilder};
use crate::input::ProcessedInput;
use crate::multiple::MultipleTreeComputation;
use crate::recalibration::{estimate_shift_ppm, recalibrated_input};
use crate::scoring::{GraphScoring, ScoreType, ScoringError};
use crate::tree::FragmentationTree;
use crate::tree_builder::{TreeBuilder, TreeBuilderError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeComputationError {
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    TreeBuilder(#[from] TreeBuilderError),
    #[error("The tree computed for {formula} has a non-finite score {score}")]
    NonFiniteTreeScore { formula: String, score: ScoreType },
    #[error("A graph building worker failed: {0}")]
    WorkerFailed(String),
    #[error("The parent peak {0} is not among the peaks of the input")]
    MissingParentPeak(usize),
}

/// Bundles the graph builder, scorers, tree builder and decomposers of one analysis
/// run. Shared between threads behind an [`Arc`].
#[derive(Debug)]
pub struct FragmentationPatternAnalysis {
    config: AnalysisConfig,
    graph_builder: Box<dyn GraphBuilder>,
    scoring: GraphScoring,
    tree_builder: Box<dyn TreeBuilder>,
    decomposers: Mutex<DecomposerCache<MassDecomposer>>,
}

impl Default for FragmentationPatternAnalysis {
    fn default() -> Self {
        Self::new(AnalysisConfig::default())
    }
}

impl FragmentationPatternAnalysis {
    pub fn new(config: AnalysisConfig) -> Self {
        let scoring = config.scoring.build();
        let tree_builder = config.build_tree_builder();
        Self::with_components(config, Box::new(SubFormulaGraphBuilder), scoring, tree_builder)
    }

    pub fn with_components(
        config: AnalysisConfig,
        graph_builder: Box<dyn GraphBuilder>,
        scoring: GraphScoring,
        tree_builder: Box<dyn TreeBuilder>,
    ) -> Self {
        let decomposers = Mutex::new(DecomposerCache::new(
            config.build_decomposer(),
            config.decomposer_cache_size,
        ));
        Self {
            config,
            graph_builder,
            scoring,
            tree_builder,
            decomposers,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn scoring(&self) -> &GraphScoring {
        &self.scoring
    }

    pub fn tree_builder(&self) -> &dyn TreeBuilder {
        self.tree_builder.as_ref()
    }

    pub fn graph_builder(&self) -> &dyn GraphBuilder {
        self.graph_builder.as_ref()
    }

    /// Fill in decompositions for every fragment peak that has none, and parent
    /// candidates if the input has none, using the shared decomposer cache.
    pub fn decompose_peaks(&self, input: &mut ProcessedInput, alphabet: &ChemicalAlphabet) {
        let mut cache = self
            .decomposers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let info = input.experiment.clone();
        let parent_peak = input.parent_peak;
        let tolerance = info.fragment_tolerance();
        let mut decomposed = 0usize;
        for peak in input.peaks.iter_mut() {
            if peak.index == parent_peak || !peak.decompositions.is_empty() {
                continue;
            }
            peak.decompositions = cache
                .decompose(alphabet, peak.mass(), tolerance, &info)
                .into_iter()
                .map(ScoredMolecularFormula::from)
                .collect();
            decomposed += 1;
        }
        if input.parent_candidates.is_empty() {
            let precursor_mass = if info.precursor_mz > 0.0 {
                info.precursor_mass()
            } else {
                input.parent().map(|p| p.mass()).unwrap_or_default()
            };
            input.parent_candidates = cache
                .decompose(alphabet, precursor_mass, info.precursor_tolerance(), &info)
                .into_iter()
                .map(ScoredMolecularFormula::from)
                .collect();
            debug!(
                "Found {} parent candidates over {alphabet} for {precursor_mass:0.4}",
                input.parent_candidates.len()
            );
        }
        debug!("Decomposed {decomposed} peaks over {alphabet}");
        input.normalize();
    }

    /// Build, score and prepare the graph of `candidate`.
    #[tracing::instrument(level = "debug", skip_all, fields(candidate = %candidate.formula))]
    pub fn build_graph(
        &self,
        input: &Arc<ProcessedInput>,
        candidate: &ScoredMolecularFormula,
    ) -> Result<FragmentationGraph, TreeComputationError> {
        if input.parent().is_none() {
            return Err(TreeComputationError::MissingParentPeak(input.parent_peak));
        }
        let mut graph = self.graph_builder.build_graph(input, candidate);
        self.scoring.score_graph(input, &mut graph)?;
        graph.prepare_for_tree_computation();
        if let Some(k) = self.config.retain_peaks {
            graph.retain_peaks(k);
        }
        Ok(graph)
    }

    /// Compute the best tree of `graph` scoring strictly above `lowerbound`,
    /// recalibrating if the configuration asks for it.
    pub fn compute_tree(
        &self,
        graph: &FragmentationGraph,
        lowerbound: ScoreType,
    ) -> Result<Option<FragmentationTree>, TreeComputationError> {
        self.compute_tree_with(graph, lowerbound, self.config.recalibration)
    }

    pub fn compute_tree_with(
        &self,
        graph: &FragmentationGraph,
        lowerbound: ScoreType,
        recalibrate: bool,
    ) -> Result<Option<FragmentationTree>, TreeComputationError> {
        let Some(tree) = self.optimize(graph, lowerbound)? else {
            debug!(
                "No tree for {} above {lowerbound:0.3}",
                graph.candidate().formula
            );
            return Ok(None);
        };
        debug!("Tree for {} scored {:0.3}", tree.candidate.formula, tree.score);
        if !recalibrate {
            return Ok(Some(tree));
        }
        match self.recalibrate(graph, &tree, lowerbound)? {
            Some(recalibrated) if recalibrated.score > tree.score => {
                debug!(
                    "Recalibration improved {} from {:0.3} to {:0.3}",
                    tree.candidate.formula, tree.score, recalibrated.score
                );
                Ok(Some(recalibrated))
            }
            _ => Ok(Some(tree)),
        }
    }

    fn optimize(
        &self,
        graph: &FragmentationGraph,
        lowerbound: ScoreType,
    ) -> Result<Option<FragmentationTree>, TreeComputationError> {
        let bound = graph.maximal_score();
        if bound <= lowerbound {
            trace!(
                "Skipping {}, its upper bound {bound:0.3} does not exceed {lowerbound:0.3}",
                graph.candidate().formula
            );
            return Ok(None);
        }
        let tree = match self
            .tree_builder
            .build_tree(graph.input(), graph, lowerbound)
        {
            Err(TreeBuilderError::NonFiniteScore { formula, score }) => {
                return Err(TreeComputationError::NonFiniteTreeScore { formula, score })
            }
            result => result?,
        };
        if let Some(tree) = tree.as_ref() {
            if !tree.score.is_finite() {
                return Err(TreeComputationError::NonFiniteTreeScore {
                    formula: tree.candidate.formula.to_string(),
                    score: tree.score,
                });
            }
            debug_assert!(tree.is_colorful());
        }
        Ok(tree)
    }

    fn recalibrate(
        &self,
        graph: &FragmentationGraph,
        tree: &FragmentationTree,
        lowerbound: ScoreType,
    ) -> Result<Option<FragmentationTree>, TreeComputationError> {
        let Some(shift) = estimate_shift_ppm(graph.input(), tree) else {
            return Ok(None);
        };
        let input = Arc::new(recalibrated_input(graph.input(), shift));
        let graph = self.build_graph(&input, graph.candidate())?;
        self.optimize(&graph, lowerbound)
    }

    /// Start a search over every parent candidate of `input`, seeded from the
    /// configuration.
    pub fn multiple_tree_computation(
        self: &Arc<Self>,
        input: Arc<ProcessedInput>,
    ) -> MultipleTreeComputation {
        MultipleTreeComputation::new(self.clone(), input)
    }

    /// The up to `max_number` best trees over all parent candidates of `input`,
    /// best first.
    pub fn compute_trees(
        self: &Arc<Self>,
        input: Arc<ProcessedInput>,
        max_number: usize,
    ) -> Result<Vec<FragmentationTree>, TreeComputationError> {
        self.multiple_tree_computation(input).list(max_number)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formula::MolecularFormula;
    use crate::input::{Ionization, ProcessedPeak};

    fn f(s: &str) -> MolecularFormula {
        s.parse().unwrap()
    }

    fn glucose_input() -> ProcessedInput {
        let ionization = Ionization::default();
        let formulas = ["C2H4O2", "C3H6O3", "C5H10O5", "C6H12O6"];
        let peaks = formulas
            .iter()
            .enumerate()
            .map(|(i, s)| {
                ProcessedPeak::new(i, ionization.mz(f(s).mass()), 10.0 * (i + 1) as f32)
                    .with_decompositions(vec![f(s).into()])
            })
            .collect();
        ProcessedInput::new(Default::default(), peaks, 3, vec![f("C6H12O6").into()])
    }

    #[test]
    fn test_build_graph_and_tree() {
        let analysis = FragmentationPatternAnalysis::default();
        let input = Arc::new(glucose_input());
        let graph = analysis
            .build_graph(&input, &input.parent_candidates[0])
            .unwrap();
        assert!(graph.is_prepared());
        assert_eq!(graph.check_invariants(), Ok(()));
        let tree = analysis.compute_tree(&graph, f64::NEG_INFINITY).unwrap().unwrap();
        assert!(tree.is_colorful());
        assert!((tree.score - tree.recompute_score()).abs() < 1e-6);
        assert!(analysis
            .compute_tree(&graph, graph.maximal_score())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_parent_peak() {
        let analysis = FragmentationPatternAnalysis::default();
        let mut input = glucose_input();
        input.parent_peak = 10;
        let input = Arc::new(input);
        assert_eq!(
            analysis
                .build_graph(&input, &f("C6H12O6").into())
                .unwrap_err(),
            TreeComputationError::MissingParentPeak(10)
        );
    }

    #[derive(Debug)]
    struct InfiniteTreeBuilder {
        report: bool,
    }

    impl TreeBuilder for InfiniteTreeBuilder {
        fn build_tree(
            &self,
            _input: &ProcessedInput,
            graph: &FragmentationGraph,
            _lowerbound: ScoreType,
        ) -> Result<Option<FragmentationTree>, TreeBuilderError> {
            if self.report {
                return Err(TreeBuilderError::NonFiniteScore {
                    formula: graph.candidate().formula.to_string(),
                    score: f64::INFINITY,
                });
            }
            Ok(Some(FragmentationTree::new(
                graph.candidate().clone(),
                graph.root().peak,
                f64::INFINITY,
            )))
        }

        fn description(&self) -> &'static str {
            "infinite"
        }
    }

    #[test]
    fn test_non_finite_tree_score() {
        let input = Arc::new(glucose_input());
        let expected = TreeComputationError::NonFiniteTreeScore {
            formula: "C6H12O6".to_string(),
            score: f64::INFINITY,
        };
        for report in [false, true] {
            let analysis = Arc::new(FragmentationPatternAnalysis::with_components(
                AnalysisConfig::default(),
                Box::new(SubFormulaGraphBuilder),
                AnalysisConfig::default().scoring.build(),
                Box::new(InfiniteTreeBuilder { report }),
            ));
            let graph = analysis
                .build_graph(&input, &input.parent_candidates[0])
                .unwrap();
            assert_eq!(
                analysis.compute_tree(&graph, f64::NEG_INFINITY).unwrap_err(),
                expected
            );
            assert_eq!(
                analysis
                    .multiple_tree_computation(input.clone())
                    .with_lowerbound(f64::NEG_INFINITY)
                    .list(3)
                    .unwrap_err(),
                expected
            );
        }
    }

    #[test]
    fn test_decompose_peaks() {
        let analysis = FragmentationPatternAnalysis::default();
        let mut input = glucose_input();
        for peak in input.peaks.iter_mut() {
            peak.decompositions.clear();
        }
        input.parent_candidates.clear();
        let alphabet = ChemicalAlphabet::parse("CHO").unwrap();
        analysis.decompose_peaks(&mut input, &alphabet);
        assert!(input
            .parent_candidates
            .iter()
            .any(|c| c.formula == f("C6H12O6")));
        assert!(input.peaks[0]
            .decompositions
            .iter()
            .any(|c| c.formula == f("C2H4O2")));
        assert!(input.peaks[3].decompositions.is_empty());
    }
}
