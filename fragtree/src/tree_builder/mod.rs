//! Strategies to select a maximum-weight colorful subtree from a prepared graph.
//!
//! Every [`TreeBuilder`] honors the same contract: it returns a tree only if the tree's
//! score is strictly greater than the lowerbound it was given, and it reports a
//! non-finite tree score as an error rather than a tree.
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Debug;

use identity_hash::BuildIdentityHasher;
use thiserror::Error;

use crate::graph::{FragmentationGraph, ROOT};
use crate::input::ProcessedInput;
use crate::scoring::ScoreType;
use crate::tree::FragmentationTree;

mod dp;

pub use dp::{DPTreeBuilder, MAX_EXACT_COLORS};

/// Maps graph vertex indices to the tree fragment indices they were copied to
pub(crate) type VertexMap = HashMap<usize, usize, BuildIdentityHasher<usize>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeBuilderError {
    #[error("The tree for {formula} has a non-finite score {score}")]
    NonFiniteScore { formula: String, score: ScoreType },
    #[error("The graph for {0} must be prepared for tree computation first")]
    GraphNotPrepared(String),
}

pub trait TreeBuilder: Send + Sync + Debug {
    /// Compute the best colorful subtree of `graph`, returning `None` if its score
    /// does not strictly exceed `lowerbound`.
    fn build_tree(
        &self,
        input: &ProcessedInput,
        graph: &FragmentationGraph,
        lowerbound: ScoreType,
    ) -> Result<Option<FragmentationTree>, TreeBuilderError>;

    fn description(&self) -> &'static str;
}

pub(crate) fn ensure_prepared(graph: &FragmentationGraph) -> Result<(), TreeBuilderError> {
    if graph.is_prepared() {
        Ok(())
    } else {
        Err(TreeBuilderError::GraphNotPrepared(
            graph.candidate().formula.to_string(),
        ))
    }
}

/// Apply the lowerbound contract to a finished tree
pub(crate) fn accept(
    tree: FragmentationTree,
    lowerbound: ScoreType,
) -> Result<Option<FragmentationTree>, TreeBuilderError> {
    if !tree.score.is_finite() {
        return Err(TreeBuilderError::NonFiniteScore {
            formula: tree.candidate.formula.to_string(),
            score: tree.score,
        });
    }
    if tree.score > lowerbound {
        Ok(Some(tree))
    } else {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy)]
struct FrontierEdge {
    weight: ScoreType,
    loss: usize,
}

impl PartialEq for FrontierEdge {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for FrontierEdge {}

impl PartialOrd for FrontierEdge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEdge {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .total_cmp(&other.weight)
            .then_with(|| other.loss.cmp(&self.loss))
    }
}

/// Repeatedly attach the best positive edge leaving the tree that reaches a vertex of a
/// color not yet in the tree.
pub(crate) fn attach_greedily(
    graph: &FragmentationGraph,
    tree: &mut FragmentationTree,
    in_tree: &mut VertexMap,
    used_colors: &mut [bool],
) {
    let mut frontier = BinaryHeap::new();
    let push_outgoing = |frontier: &mut BinaryHeap<FrontierEdge>, vertex: usize| {
        for &loss in graph.fragment(vertex).outgoing() {
            let weight = graph.loss(loss).weight;
            if weight > 0.0 {
                frontier.push(FrontierEdge { weight, loss });
            }
        }
    };
    for vertex in in_tree.keys().copied() {
        push_outgoing(&mut frontier, vertex);
    }
    while let Some(edge) = frontier.pop() {
        let loss = graph.loss(edge.loss);
        let child = graph.fragment(loss.tail);
        if used_colors[child.color] || in_tree.contains_key(&loss.tail) {
            continue;
        }
        let Some(&parent) = in_tree.get(&loss.head) else {
            continue;
        };
        let index = tree.add_fragment(
            parent,
            child.formula().clone(),
            child.peak,
            child.color,
            loss.formula.clone(),
            loss.weight,
        );
        used_colors[child.color] = true;
        in_tree.insert(loss.tail, index);
        push_outgoing(&mut frontier, loss.tail);
    }
}

/// A fast heuristic that grows the tree from the root, always taking the best
/// positive edge to an unused color.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyTreeBuilder;

impl TreeBuilder for GreedyTreeBuilder {
    fn build_tree(
        &self,
        _input: &ProcessedInput,
        graph: &FragmentationGraph,
        lowerbound: ScoreType,
    ) -> Result<Option<FragmentationTree>, TreeBuilderError> {
        ensure_prepared(graph)?;
        let root = graph.root();
        let mut tree =
            FragmentationTree::new(graph.candidate().clone(), root.peak, graph.root_score());
        let mut in_tree = VertexMap::default();
        in_tree.insert(ROOT, 0);
        let mut used_colors = vec![false; graph.number_of_colors()];
        used_colors[0] = true;
        attach_greedily(graph, &mut tree, &mut in_tree, &mut used_colors);
        accept(tree, lowerbound)
    }

    fn description(&self) -> &'static str {
        "greedy"
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::Arc;

    use crate::formula::MolecularFormula;
    use crate::input::ProcessedPeak;

    fn f(s: &str) -> MolecularFormula {
        s.parse().unwrap()
    }

    /// Two fragments of the same peak compete for one color: the greedy choice takes
    /// the heavier edge first, the exact solution prefers the lighter one with a child.
    pub(crate) fn competing_graph() -> FragmentationGraph {
        let peaks = (0..4)
            .map(|i| ProcessedPeak::new(i, 50.0 + 10.0 * i as f64, 1.0))
            .collect();
        let input = Arc::new(ProcessedInput::new(Default::default(), peaks, 3, vec![]));
        let mut graph = FragmentationGraph::new(input, f("C6H12O6").into());
        let a1 = graph.add_fragment(2, f("C5H10O5").into());
        let a2 = graph.add_fragment(2, f("C5H8O4").into());
        let b = graph.add_fragment(1, f("C4H8O4").into());
        let c = graph.add_fragment(0, f("C2H4O2").into());
        graph.add_loss(ROOT, a1, f("CH2O"));
        graph.add_loss(ROOT, a2, f("CH4O2"));
        graph.add_loss(a1, b, f("CH2O"));
        graph.add_loss(ROOT, c, f("C4H8O4"));
        graph.add_loss(b, c, f("C2H4O2"));
        graph.set_root_score(1.0);
        graph.set_weights(vec![1.0, 2.0, 3.0, 0.5, 1.0]);
        graph.prepare_for_tree_computation();
        graph
    }

    #[test]
    fn test_greedy() {
        let graph = competing_graph();
        let tree = GreedyTreeBuilder
            .build_tree(graph.input(), &graph, 0.0)
            .unwrap()
            .unwrap();
        // root -> a2 (2.0), root -> c (0.5)
        assert_eq!(tree.score, 3.5);
        assert!(tree.is_colorful());
        assert!(GreedyTreeBuilder
            .build_tree(graph.input(), &graph, 3.5)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unprepared() {
        let mut graph = competing_graph();
        graph.set_weight(0, 1.0);
        assert!(matches!(
            GreedyTreeBuilder.build_tree(graph.input(), &graph, 0.0),
            Err(TreeBuilderError::GraphNotPrepared(_))
        ));
    }
}
