//! Composable scoring of fragmentation graphs.
//!
//! Three kinds of pluggable scorers contribute to edge weights:
//!
//! - [`DecompositionScorer`]s score a candidate formula for a single peak. The same
//!   trait is used for the root (precursor) and for fragments.
//! - [`LossScorer`]s score an edge, i.e. a neutral loss between two fragments.
//! - [`PeakPairScorer`]s score a pair of peaks independently of their formulas.
//!
//! Every scorer may prepare a context once per spectrum which is then reused for every
//! call to `score`. [`GraphScoring`] binds each scorer to its prepared context and
//! combines the contributions:
//!
//! ```text
//! weight(u -> v) = vertex_score(v) + Σ loss_scores(u -> v) + pair_score[peak(u)][peak(v)]
//! ```
use std::fmt::Debug;

use rayon::prelude::*;
use thiserror::Error;
use tracing::trace;

use crate::formula::{MolecularFormula, ScoredMolecularFormula};
use crate::graph::{FragmentationGraph, Loss};
use crate::input::{ProcessedInput, ProcessedPeak};

mod loss;
mod pair;
mod vertex;

pub use loss::{CommonLossScorer, FreeRadicalLossScorer};
pub use pair::{CollisionEnergyPeakPairScorer, LossSizePeakPairScorer};
pub use vertex::{HeteroAtomRatioScorer, MassDeviationScorer, RelativeIntensityScorer};

/// The numeric type of all scores, which are log-likelihoods or log-odds
pub type ScoreType = f64;

/// Raised when any score contribution is not a number
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    #[error("Root score of {formula} is not a number")]
    NaNRootScore { formula: String },
    #[error("Score of {formula} for peak {peak} is not a number")]
    NaNVertexScore { formula: String, peak: usize },
    #[error("Weight of loss {formula} from vertex {head} to vertex {tail} is not a number")]
    NaNEdgeScore {
        formula: String,
        head: usize,
        tail: usize,
    },
}

/// Scores a formula as the explanation of a peak
pub trait DecompositionScorer: Send + Sync + Debug {
    type Prepared: Send + Sync;

    fn prepare(&self, input: &ProcessedInput) -> Self::Prepared;

    fn score(
        &self,
        formula: &MolecularFormula,
        peak: &ProcessedPeak,
        input: &ProcessedInput,
        prepared: &Self::Prepared,
    ) -> ScoreType;
}

/// Scores a neutral loss edge of a fragmentation graph
pub trait LossScorer: Send + Sync + Debug {
    type Prepared: Send + Sync;

    fn prepare(&self, input: &ProcessedInput) -> Self::Prepared;

    fn score(
        &self,
        loss: &Loss,
        graph: &FragmentationGraph,
        input: &ProcessedInput,
        prepared: &Self::Prepared,
    ) -> ScoreType;
}

/// Scores every ordered pair of peaks, accumulating into `scores[parent][child]`.
///
/// Only entries where the parent peak is heavier than the child peak are ever read.
pub trait PeakPairScorer: Send + Sync + Debug {
    fn score(&self, peaks: &[ProcessedPeak], input: &ProcessedInput, scores: &mut [Vec<ScoreType>]);
}

/// A decomposition scorer bound to its prepared context
pub trait PreparedDecompositionScorer: Send + Sync {
    fn score(&self, formula: &MolecularFormula, peak: &ProcessedPeak, input: &ProcessedInput)
        -> ScoreType;
}

/// A loss scorer bound to its prepared context
pub trait PreparedLossScorer: Send + Sync {
    fn score(&self, loss: &Loss, graph: &FragmentationGraph, input: &ProcessedInput) -> ScoreType;
}

struct BoundDecompositionScorer<'a, S: DecompositionScorer> {
    scorer: &'a S,
    prepared: S::Prepared,
}

impl<S: DecompositionScorer> PreparedDecompositionScorer for BoundDecompositionScorer<'_, S> {
    fn score(
        &self,
        formula: &MolecularFormula,
        peak: &ProcessedPeak,
        input: &ProcessedInput,
    ) -> ScoreType {
        self.scorer.score(formula, peak, input, &self.prepared)
    }
}

struct BoundLossScorer<'a, S: LossScorer> {
    scorer: &'a S,
    prepared: S::Prepared,
}

impl<S: LossScorer> PreparedLossScorer for BoundLossScorer<'_, S> {
    fn score(&self, loss: &Loss, graph: &FragmentationGraph, input: &ProcessedInput) -> ScoreType {
        self.scorer.score(loss, graph, input, &self.prepared)
    }
}

/// Object-safe view of a [`DecompositionScorer`] so heterogeneous scorers can share a list
pub trait DynDecompositionScorer: Send + Sync + Debug {
    fn bind<'a>(&'a self, input: &ProcessedInput) -> Box<dyn PreparedDecompositionScorer + 'a>;
}

impl<S: DecompositionScorer> DynDecompositionScorer for S {
    fn bind<'a>(&'a self, input: &ProcessedInput) -> Box<dyn PreparedDecompositionScorer + 'a> {
        Box::new(BoundDecompositionScorer {
            scorer: self,
            prepared: self.prepare(input),
        })
    }
}

/// Object-safe view of a [`LossScorer`]
pub trait DynLossScorer: Send + Sync + Debug {
    fn bind<'a>(&'a self, input: &ProcessedInput) -> Box<dyn PreparedLossScorer + 'a>;
}

impl<S: LossScorer> DynLossScorer for S {
    fn bind<'a>(&'a self, input: &ProcessedInput) -> Box<dyn PreparedLossScorer + 'a> {
        Box::new(BoundLossScorer {
            scorer: self,
            prepared: self.prepare(input),
        })
    }
}

/// The scorers of an analysis, prepared per spectrum and combined into edge weights
#[derive(Debug, Default)]
pub struct GraphScoring {
    root_scorers: Vec<Box<dyn DynDecompositionScorer>>,
    decomposition_scorers: Vec<Box<dyn DynDecompositionScorer>>,
    loss_scorers: Vec<Box<dyn DynLossScorer>>,
    peak_pair_scorers: Vec<Box<dyn PeakPairScorer>>,
}

/// All scorers of a [`GraphScoring`] prepared for one spectrum
pub struct PreparedScoring<'a> {
    root_scorers: Vec<Box<dyn PreparedDecompositionScorer + 'a>>,
    decomposition_scorers: Vec<Box<dyn PreparedDecompositionScorer + 'a>>,
    loss_scorers: Vec<Box<dyn PreparedLossScorer + 'a>>,
    peak_pair_scores: Vec<Vec<ScoreType>>,
}

impl GraphScoring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_scorer<S: DecompositionScorer + 'static>(mut self, scorer: S) -> Self {
        self.root_scorers.push(Box::new(scorer));
        self
    }

    pub fn with_decomposition_scorer<S: DecompositionScorer + 'static>(mut self, scorer: S) -> Self {
        self.decomposition_scorers.push(Box::new(scorer));
        self
    }

    pub fn with_loss_scorer<S: LossScorer + 'static>(mut self, scorer: S) -> Self {
        self.loss_scorers.push(Box::new(scorer));
        self
    }

    pub fn with_peak_pair_scorer<S: PeakPairScorer + 'static>(mut self, scorer: S) -> Self {
        self.peak_pair_scorers.push(Box::new(scorer));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.root_scorers.is_empty()
            && self.decomposition_scorers.is_empty()
            && self.loss_scorers.is_empty()
            && self.peak_pair_scorers.is_empty()
    }

    /// Run every scorer's preparation step and fill the peak pair matrix for `input`
    pub fn prepare<'a>(&'a self, input: &ProcessedInput) -> PreparedScoring<'a> {
        let n = input.peaks.len();
        let mut peak_pair_scores = vec![vec![0.0; n]; n];
        for scorer in self.peak_pair_scorers.iter() {
            scorer.score(&input.peaks, input, &mut peak_pair_scores);
        }
        PreparedScoring {
            root_scorers: self.root_scorers.iter().map(|s| s.bind(input)).collect(),
            decomposition_scorers: self
                .decomposition_scorers
                .iter()
                .map(|s| s.bind(input))
                .collect(),
            loss_scorers: self.loss_scorers.iter().map(|s| s.bind(input)).collect(),
            peak_pair_scores,
        }
    }

    /// Assign the root score, and a weight to every edge, of a freshly built graph
    pub fn score_graph(
        &self,
        input: &ProcessedInput,
        graph: &mut FragmentationGraph,
    ) -> Result<(), ScoringError> {
        let prepared = self.prepare(input);
        prepared.score_graph(input, graph)
    }
}

impl PreparedScoring<'_> {
    pub fn root_score(
        &self,
        candidate: &ScoredMolecularFormula,
        peak: &ProcessedPeak,
        input: &ProcessedInput,
    ) -> Result<ScoreType, ScoringError> {
        let score = candidate.score
            + self
                .root_scorers
                .iter()
                .map(|s| s.score(&candidate.formula, peak, input))
                .sum::<ScoreType>();
        if score.is_nan() {
            Err(ScoringError::NaNRootScore {
                formula: candidate.formula.to_string(),
            })
        } else {
            Ok(score)
        }
    }

    pub fn vertex_score(
        &self,
        decomposition: &ScoredMolecularFormula,
        peak: &ProcessedPeak,
        input: &ProcessedInput,
    ) -> Result<ScoreType, ScoringError> {
        let score = decomposition.score
            + self
                .decomposition_scorers
                .iter()
                .map(|s| s.score(&decomposition.formula, peak, input))
                .sum::<ScoreType>();
        if score.is_nan() {
            Err(ScoringError::NaNVertexScore {
                formula: decomposition.formula.to_string(),
                peak: peak.index,
            })
        } else {
            Ok(score)
        }
    }

    pub fn peak_pair_score(&self, parent_peak: usize, child_peak: usize) -> ScoreType {
        self.peak_pair_scores[parent_peak][child_peak]
    }

    pub fn score_graph(
        &self,
        input: &ProcessedInput,
        graph: &mut FragmentationGraph,
    ) -> Result<(), ScoringError> {
        let root = graph.root();
        let root_score = self.root_score(&root.decomposition, input.peak(root.peak), input)?;

        let vertex_scores: Vec<ScoreType> = graph
            .fragments()
            .par_iter()
            .map(|f| {
                if f.is_root() {
                    Ok(0.0)
                } else {
                    self.vertex_score(&f.decomposition, input.peak(f.peak), input)
                }
            })
            .collect::<Result<_, _>>()?;

        let weights: Vec<ScoreType> = {
            let graph_ref: &FragmentationGraph = graph;
            graph_ref
                .losses()
                .par_iter()
                .map(|loss| {
                    let head = graph_ref.fragment(loss.head);
                    let tail = graph_ref.fragment(loss.tail);
                    let weight = vertex_scores[loss.tail]
                        + self
                            .loss_scorers
                            .iter()
                            .map(|s| s.score(loss, graph_ref, input))
                            .sum::<ScoreType>()
                        + self.peak_pair_score(head.peak, tail.peak);
                    if weight.is_nan() {
                        Err(ScoringError::NaNEdgeScore {
                            formula: loss.formula.to_string(),
                            head: loss.head,
                            tail: loss.tail,
                        })
                    } else {
                        Ok(weight)
                    }
                })
                .collect::<Result<_, _>>()?
        };
        trace!(
            "Scored {} vertices and {} edges, root score {root_score:0.3}",
            vertex_scores.len(),
            weights.len()
        );
        graph.set_root_score(root_score);
        graph.set_weights(weights);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct CountingScorer {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl DecompositionScorer for CountingScorer {
        type Prepared = f64;

        fn prepare(&self, input: &ProcessedInput) -> Self::Prepared {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            input.peaks.len() as f64
        }

        fn score(
            &self,
            _formula: &MolecularFormula,
            _peak: &ProcessedPeak,
            _input: &ProcessedInput,
            prepared: &Self::Prepared,
        ) -> ScoreType {
            *prepared
        }
    }

    #[test]
    fn test_prepare_once_score_many() {
        let scorer = CountingScorer {
            calls: Default::default(),
        };
        let input = ProcessedInput {
            peaks: vec![ProcessedPeak::new(0, 100.0, 1.0), ProcessedPeak::new(1, 50.0, 1.0)],
            ..Default::default()
        };
        let bound = scorer.bind(&input);
        let formula: MolecularFormula = "CH4".parse().unwrap();
        for peak in input.peaks.iter() {
            assert_eq!(bound.score(&formula, peak, &input), 2.0);
        }
        assert_eq!(scorer.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    struct NaNScorer;

    impl DecompositionScorer for NaNScorer {
        type Prepared = ();

        fn prepare(&self, _input: &ProcessedInput) -> Self::Prepared {}

        fn score(
            &self,
            formula: &MolecularFormula,
            _peak: &ProcessedPeak,
            _input: &ProcessedInput,
            _prepared: &Self::Prepared,
        ) -> ScoreType {
            if formula.count_of("O") == 0 {
                f64::NAN
            } else {
                1.0
            }
        }
    }

    #[derive(Debug)]
    struct NaNLossScorer;

    impl LossScorer for NaNLossScorer {
        type Prepared = ();

        fn prepare(&self, _input: &ProcessedInput) -> Self::Prepared {}

        fn score(
            &self,
            _loss: &Loss,
            _graph: &FragmentationGraph,
            _input: &ProcessedInput,
            _prepared: &Self::Prepared,
        ) -> ScoreType {
            f64::NAN
        }
    }

    #[derive(Debug)]
    struct NaNPeakPairScorer;

    impl PeakPairScorer for NaNPeakPairScorer {
        fn score(&self, _peaks: &[ProcessedPeak], _input: &ProcessedInput, scores: &mut [Vec<ScoreType>]) {
            for row in scores.iter_mut() {
                row.fill(f64::NAN);
            }
        }
    }

    fn two_vertex_graph(parent: &str, child: &str) -> FragmentationGraph {
        let parent: MolecularFormula = parent.parse().unwrap();
        let child: MolecularFormula = child.parse().unwrap();
        let loss = parent.checked_sub(&child).unwrap();
        let input = std::sync::Arc::new(ProcessedInput::new(
            Default::default(),
            vec![ProcessedPeak::new(0, 29.04, 1.0), ProcessedPeak::new(1, 181.07, 1.0)],
            1,
            vec![parent.clone().into()],
        ));
        let mut graph = FragmentationGraph::new(input, parent.into());
        let tail = graph.add_fragment(0, child.into());
        graph.add_loss(crate::graph::ROOT, tail, loss);
        graph
    }

    #[test]
    fn test_nan_vertex_score() {
        let mut graph = two_vertex_graph("C6H12O6", "C2H4");
        let input = graph.input().clone();
        let scoring = GraphScoring::new().with_decomposition_scorer(NaNScorer);
        assert_eq!(
            scoring.score_graph(&input, &mut graph),
            Err(ScoringError::NaNVertexScore {
                formula: "C2H4".to_string(),
                peak: 0
            })
        );

        // The root is only scored by root scorers
        let scoring = GraphScoring::new().with_root_scorer(NaNScorer);
        assert!(scoring.score_graph(&input, &mut graph).is_ok());
    }

    #[test]
    fn test_nan_root_score() {
        let mut graph = two_vertex_graph("C6H14", "C2H4");
        let input = graph.input().clone();
        let scoring = GraphScoring::new().with_root_scorer(NaNScorer);
        assert_eq!(
            scoring.score_graph(&input, &mut graph),
            Err(ScoringError::NaNRootScore {
                formula: "C6H14".to_string()
            })
        );
    }

    #[test]
    fn test_nan_edge_score() {
        let mut graph = two_vertex_graph("C6H12O6", "C2H4O2");
        let input = graph.input().clone();
        let expected = Err(ScoringError::NaNEdgeScore {
            formula: "C4H8O4".to_string(),
            head: 0,
            tail: 1,
        });

        let scoring = GraphScoring::new().with_loss_scorer(NaNLossScorer);
        assert_eq!(scoring.score_graph(&input, &mut graph), expected);

        let scoring = GraphScoring::new().with_peak_pair_scorer(NaNPeakPairScorer);
        assert_eq!(scoring.score_graph(&input, &mut graph), expected);
    }
}
