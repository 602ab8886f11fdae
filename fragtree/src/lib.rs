pub mod formula;
pub mod input;
pub mod decomposer;
pub mod scoring;
pub mod graph;
pub mod tree;
pub mod tree_builder;
pub mod recalibration;

pub mod config;
pub mod analysis;
pub mod multiple;

pub use crate::analysis::{FragmentationPatternAnalysis, TreeComputationError};
pub use crate::config::{AnalysisConfig, ScoringConfig, TreeBuilderKind};
pub use crate::decomposer::{Decomposer, DecomposerCache, MassDecomposer};
pub use crate::formula::{ChemicalAlphabet, FormulaError, MolecularFormula, ScoredMolecularFormula};
pub use crate::graph::{FragmentationGraph, GraphBuilder, GraphError, SubFormulaGraphBuilder};
pub use crate::input::{ExperimentInfo, Ionization, ProcessedInput, ProcessedPeak};
pub use crate::multiple::{MultipleTreeComputation, TreeIterator};
pub use crate::scoring::{GraphScoring, ScoreType, ScoringError};
pub use crate::tree::{FragmentationTree, TreeFragment, TreeLoss};
pub use crate::tree_builder::{DPTreeBuilder, GreedyTreeBuilder, TreeBuilder, TreeBuilderError};
