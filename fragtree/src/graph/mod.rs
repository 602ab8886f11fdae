//! The colored, rooted DAG of candidate fragment formulas.
//!
//! Vertices ([`GraphFragment`]) and edges ([`Loss`]) are stored in contiguous arrays
//! owned by the [`FragmentationGraph`] and refer to each other by index. Removing
//! vertices or edges compacts both arrays, preserving the relative order of survivors,
//! so the root always stays at index `0`.
//!
//! Each vertex is colored by the peak it explains. A fragmentation tree may use each
//! color at most once.
use std::mem;
use std::sync::Arc;

use thiserror::Error;
use tracing::{trace, warn};

use crate::formula::{MolecularFormula, ScoredMolecularFormula};
use crate::input::ProcessedInput;
use crate::scoring::ScoreType;

mod builder;

pub use builder::{GraphBuilder, SubFormulaGraphBuilder};

/// The vertex index of the root fragment
pub const ROOT: usize = 0;

/// Structural problems detected by [`FragmentationGraph::check_invariants`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("The graph has no root vertex")]
    Empty,
    #[error("The root vertex must be at index 0 with color 0 and no incoming edges")]
    RootMisplaced,
    #[error("Vertex {0} does not know its own index")]
    IndexMismatch(usize),
    #[error("Loss {0} refers to a vertex outside the graph or to itself")]
    DanglingLoss(usize),
    #[error("Loss {0} is missing from the adjacency lists of its endpoints")]
    AdjacencyMismatch(usize),
    #[error("Vertex {0} shares the root color")]
    RootColorReused(usize),
    #[error("Vertex {0} is not reachable from the root")]
    Unreachable(usize),
    #[error("Loss {0} has an infinite weight")]
    InfiniteWeight(usize),
}

/// A candidate formula for one peak
#[derive(Debug, Clone, PartialEq)]
pub struct GraphFragment {
    pub index: usize,
    pub color: usize,
    pub peak: usize,
    pub decomposition: ScoredMolecularFormula,
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
}

impl GraphFragment {
    pub fn is_root(&self) -> bool {
        self.index == ROOT
    }

    pub fn formula(&self) -> &MolecularFormula {
        &self.decomposition.formula
    }

    /// Indices of the losses ending in this fragment
    pub fn incoming(&self) -> &[usize] {
        &self.incoming
    }

    /// Indices of the losses leaving this fragment
    pub fn outgoing(&self) -> &[usize] {
        &self.outgoing
    }

    pub fn in_degree(&self) -> usize {
        self.incoming.len()
    }

    pub fn out_degree(&self) -> usize {
        self.outgoing.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.outgoing.is_empty()
    }
}

/// A neutral loss from `head` (the parent fragment) to `tail` (the child fragment)
#[derive(Debug, Clone, PartialEq)]
pub struct Loss {
    pub head: usize,
    pub tail: usize,
    pub formula: MolecularFormula,
    pub weight: ScoreType,
}

#[derive(Debug, Clone, Copy)]
struct StackNode {
    fragment: usize,
    sibling: usize,
}

#[derive(Debug, Clone)]
pub struct FragmentationGraph {
    input: Arc<ProcessedInput>,
    fragments: Vec<GraphFragment>,
    losses: Vec<Loss>,
    root_score: ScoreType,
    /// Peak index of each color, color `0` being the parent peak
    filtered_peaks: Vec<usize>,
    prepared: bool,
}

impl FragmentationGraph {
    /// Create a graph holding only the root vertex for `candidate`, explaining the
    /// input's parent peak.
    pub fn new(input: Arc<ProcessedInput>, candidate: ScoredMolecularFormula) -> Self {
        let parent_peak = input.parent_peak;
        let mut filtered_peaks = Vec::with_capacity(input.peaks.len());
        filtered_peaks.push(parent_peak);
        filtered_peaks.extend((0..input.peaks.len()).filter(|i| *i != parent_peak));
        let root = GraphFragment {
            index: ROOT,
            color: 0,
            peak: parent_peak,
            decomposition: candidate,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        };
        Self {
            input,
            fragments: vec![root],
            losses: Vec::new(),
            root_score: 0.0,
            filtered_peaks,
            prepared: false,
        }
    }

    /// Add a vertex for `decomposition` of `peak`, colored by that peak
    pub fn add_fragment(&mut self, peak: usize, decomposition: ScoredMolecularFormula) -> usize {
        let color = self
            .filtered_peaks
            .iter()
            .position(|p| *p == peak)
            .unwrap_or(self.filtered_peaks.len());
        if color == self.filtered_peaks.len() {
            self.filtered_peaks.push(peak);
        }
        let index = self.fragments.len();
        self.fragments.push(GraphFragment {
            index,
            color,
            peak,
            decomposition,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        });
        self.prepared = false;
        index
    }

    /// Add an edge of weight `0` from `head` to `tail`
    pub fn add_loss(&mut self, head: usize, tail: usize, formula: MolecularFormula) -> usize {
        debug_assert!(head != tail && tail != ROOT);
        let index = self.losses.len();
        self.losses.push(Loss {
            head,
            tail,
            formula,
            weight: 0.0,
        });
        self.fragments[head].outgoing.push(index);
        self.fragments[tail].incoming.push(index);
        self.prepared = false;
        index
    }

    pub fn input(&self) -> &Arc<ProcessedInput> {
        &self.input
    }

    pub fn root(&self) -> &GraphFragment {
        &self.fragments[ROOT]
    }

    /// The precursor formula this graph was built for
    pub fn candidate(&self) -> &ScoredMolecularFormula {
        &self.fragments[ROOT].decomposition
    }

    pub fn fragment(&self, index: usize) -> &GraphFragment {
        &self.fragments[index]
    }

    pub fn fragments(&self) -> &[GraphFragment] {
        &self.fragments
    }

    pub fn loss(&self, index: usize) -> &Loss {
        &self.losses[index]
    }

    pub fn losses(&self) -> &[Loss] {
        &self.losses
    }

    pub fn number_of_vertices(&self) -> usize {
        self.fragments.len()
    }

    pub fn number_of_edges(&self) -> usize {
        self.losses.len()
    }

    /// The number of colors including the root color
    pub fn number_of_colors(&self) -> usize {
        self.filtered_peaks.len()
    }

    /// Peak indices in color order
    pub fn filtered_peaks(&self) -> &[usize] {
        &self.filtered_peaks
    }

    pub fn root_score(&self) -> ScoreType {
        self.root_score
    }

    pub fn set_root_score(&mut self, score: ScoreType) {
        self.root_score = score;
    }

    pub fn set_weight(&mut self, loss: usize, weight: ScoreType) {
        self.losses[loss].weight = weight;
        self.prepared = false;
    }

    /// Replace every edge weight at once, in loss index order
    pub fn set_weights(&mut self, weights: Vec<ScoreType>) {
        debug_assert_eq!(weights.len(), self.losses.len());
        for (loss, weight) in self.losses.iter_mut().zip(weights) {
            loss.weight = weight;
        }
        self.prepared = false;
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn incoming_losses(&self, vertex: usize) -> impl Iterator<Item = &Loss> + '_ {
        self.fragments[vertex]
            .incoming
            .iter()
            .map(|l| &self.losses[*l])
    }

    pub fn outgoing_losses(&self, vertex: usize) -> impl Iterator<Item = &Loss> + '_ {
        self.fragments[vertex]
            .outgoing
            .iter()
            .map(|l| &self.losses[*l])
    }

    /// The edge from `head` to `tail`, if there is one
    pub fn loss_of(&self, head: usize, tail: usize) -> Option<&Loss> {
        self.incoming_losses(tail).find(|l| l.head == head)
    }

    pub fn fragments_with_color(&self, color: usize) -> impl Iterator<Item = &GraphFragment> + '_ {
        self.fragments.iter().filter(move |f| f.color == color)
    }

    /// Vertices reachable from the root through vertices of color at most `max_color`,
    /// every vertex listed after all of its listed descendants. The root comes last.
    pub fn vertices_in_post_order(&self, max_color: usize) -> Vec<usize> {
        let mut visited = vec![false; self.fragments.len()];
        let mut order = Vec::with_capacity(self.fragments.len());
        let mut stack = vec![StackNode {
            fragment: ROOT,
            sibling: 0,
        }];
        visited[ROOT] = true;
        while let Some(top) = stack.last_mut() {
            if let Some(&loss) = self.fragments[top.fragment].outgoing.get(top.sibling) {
                top.sibling += 1;
                let child = self.losses[loss].tail;
                if !visited[child] && self.fragments[child].color <= max_color {
                    visited[child] = true;
                    stack.push(StackNode {
                        fragment: child,
                        sibling: 0,
                    });
                }
            } else {
                order.push(top.fragment);
                stack.pop();
            }
        }
        order
    }

    fn reachable(&self, dead_losses: &[bool]) -> Vec<bool> {
        let mut seen = vec![false; self.fragments.len()];
        let mut stack = vec![ROOT];
        seen[ROOT] = true;
        while let Some(v) = stack.pop() {
            for &l in self.fragments[v].outgoing.iter() {
                if dead_losses[l] {
                    continue;
                }
                let t = self.losses[l].tail;
                if !seen[t] {
                    seen[t] = true;
                    stack.push(t);
                }
            }
        }
        seen
    }

    /// Drop the flagged vertices and edges, along with every edge touching a dropped
    /// vertex, and compact the arrays.
    fn remove(&mut self, dead_vertices: &[bool], dead_losses: &[bool]) {
        debug_assert!(!dead_vertices[ROOT]);
        let mut remap = vec![usize::MAX; self.fragments.len()];
        let mut fragments = Vec::with_capacity(self.fragments.len());
        for (i, mut fragment) in mem::take(&mut self.fragments).into_iter().enumerate() {
            if dead_vertices[i] {
                continue;
            }
            remap[i] = fragments.len();
            fragment.index = remap[i];
            fragment.incoming.clear();
            fragment.outgoing.clear();
            fragments.push(fragment);
        }
        let mut losses = Vec::with_capacity(self.losses.len());
        for (i, mut loss) in mem::take(&mut self.losses).into_iter().enumerate() {
            if dead_losses[i] || dead_vertices[loss.head] || dead_vertices[loss.tail] {
                continue;
            }
            loss.head = remap[loss.head];
            loss.tail = remap[loss.tail];
            let index = losses.len();
            fragments[loss.head].outgoing.push(index);
            fragments[loss.tail].incoming.push(index);
            losses.push(loss);
        }
        self.fragments = fragments;
        self.losses = losses;
    }

    /// Remove non-root leaves whose incoming edges all have non-positive weight. A
    /// parent that becomes a leaf this way is examined in the same pass.
    ///
    /// Returns `true` if anything was removed.
    pub fn trim_leaves(&mut self) -> bool {
        let order = self.vertices_in_post_order(usize::MAX);
        let mut out_degree: Vec<usize> = self.fragments.iter().map(|f| f.outgoing.len()).collect();
        let mut dead_vertices = vec![false; self.fragments.len()];
        let mut dead_losses = vec![false; self.losses.len()];
        let mut removed = 0usize;
        for v in order {
            if v == ROOT || out_degree[v] > 0 {
                continue;
            }
            let fragment = &self.fragments[v];
            if fragment
                .incoming
                .iter()
                .all(|l| self.losses[*l].weight <= 0.0)
            {
                dead_vertices[v] = true;
                removed += 1;
                for &l in fragment.incoming.iter() {
                    dead_losses[l] = true;
                    out_degree[self.losses[l].head] -= 1;
                }
            }
        }
        if removed > 0 {
            trace!(
                "Trimmed {removed} / {} leaves with non-positive incoming edges",
                self.fragments.len()
            );
            self.remove(&dead_vertices, &dead_losses);
            self.prepared = false;
        }
        removed > 0
    }

    /// Remove edges of infinite weight, then every vertex no longer reachable from
    /// the root.
    ///
    /// Returns `true` if anything was removed.
    pub fn trim_edges(&mut self) -> bool {
        let mut dead_losses = vec![false; self.losses.len()];
        let mut removed_edges = 0usize;
        for (i, loss) in self.losses.iter().enumerate() {
            if loss.weight.is_infinite() {
                if loss.weight > 0.0 {
                    warn!(
                        "Discarding loss {} from {} to {} with weight +inf",
                        loss.formula,
                        self.fragments[loss.head].formula(),
                        self.fragments[loss.tail].formula()
                    );
                }
                dead_losses[i] = true;
                removed_edges += 1;
            }
        }
        let reachable = self.reachable(&dead_losses);
        let dead_vertices: Vec<bool> = reachable.iter().map(|r| !r).collect();
        let removed_vertices = dead_vertices.iter().filter(|d| **d).count();
        if removed_edges > 0 || removed_vertices > 0 {
            trace!(
                "Trimmed {removed_edges} / {} infinite edges and {removed_vertices} / {} unreachable vertices",
                self.losses.len(),
                self.fragments.len()
            );
            self.remove(&dead_vertices, &dead_losses);
            self.prepared = false;
            true
        } else {
            false
        }
    }

    /// Trim to a fixpoint, then recolor so that colors are ranked by the best
    /// incoming edge of their peak. The root keeps color `0`.
    pub fn prepare_for_tree_computation(&mut self) {
        if self.prepared {
            return;
        }
        loop {
            let trimmed_leaves = self.trim_leaves();
            let trimmed_edges = self.trim_edges();
            if !trimmed_leaves && !trimmed_edges {
                break;
            }
        }
        self.recolor();
        self.prepared = true;
        debug_assert_eq!(self.check_invariants(), Ok(()));
    }

    fn best_incoming_by_peak(&self) -> Vec<ScoreType> {
        let mut best = vec![f64::NEG_INFINITY; self.input.peaks.len()];
        best[self.root().peak] = f64::INFINITY;
        for fragment in self.fragments.iter().skip(1) {
            for &l in fragment.incoming.iter() {
                let w = self.losses[l].weight;
                if w > best[fragment.peak] {
                    best[fragment.peak] = w;
                }
            }
        }
        best
    }

    fn recolor(&mut self) {
        let best = self.best_incoming_by_peak();
        let mut peaks: Vec<usize> = (0..best.len()).filter(|p| best[*p] > f64::NEG_INFINITY).collect();
        peaks.sort_by(|a, b| best[*b].total_cmp(&best[*a]).then(a.cmp(b)));
        let mut color_of_peak = vec![usize::MAX; best.len()];
        for (color, peak) in peaks.iter().enumerate() {
            color_of_peak[*peak] = color;
        }
        for fragment in self.fragments.iter_mut() {
            fragment.color = color_of_peak[fragment.peak];
        }
        self.filtered_peaks = peaks;
    }

    /// Keep only the root color and the `k` best-ranked colors after it, deleting
    /// every vertex that loses all of its parents in the process. The graph is
    /// prepared for tree computation afterwards.
    pub fn retain_peaks(&mut self, k: usize) {
        self.prepare_for_tree_computation();
        if self.number_of_colors() <= k + 1 {
            return;
        }
        let mut in_degree: Vec<usize> = self.fragments.iter().map(|f| f.incoming.len()).collect();
        let mut dead_vertices = vec![false; self.fragments.len()];
        let mut dead_losses = vec![false; self.losses.len()];
        let mut worklist: Vec<usize> = self
            .fragments
            .iter()
            .filter(|f| f.color > k)
            .map(|f| f.index)
            .collect();
        for v in worklist.iter() {
            dead_vertices[*v] = true;
        }
        while let Some(v) = worklist.pop() {
            for &l in self.fragments[v].outgoing.iter() {
                if dead_losses[l] {
                    continue;
                }
                dead_losses[l] = true;
                let tail = self.losses[l].tail;
                in_degree[tail] -= 1;
                if in_degree[tail] == 0 && !dead_vertices[tail] {
                    dead_vertices[tail] = true;
                    worklist.push(tail);
                }
            }
        }
        let removed = dead_vertices.iter().filter(|d| **d).count();
        trace!(
            "Retaining {k} colors removed {removed} / {} vertices",
            self.fragments.len()
        );
        self.remove(&dead_vertices, &dead_losses);
        self.prepared = false;
        self.prepare_for_tree_computation();
    }

    /// An upper bound on the score of any colorful subtree: the root score plus, for
    /// each non-root color, the best positive incoming edge weight of that color.
    pub fn maximal_score(&self) -> ScoreType {
        let mut best = vec![0.0; self.number_of_colors()];
        for fragment in self.fragments.iter().skip(1) {
            if let Some(slot) = best.get_mut(fragment.color) {
                for &l in fragment.incoming.iter() {
                    *slot = self.losses[l].weight.max(*slot);
                }
            }
        }
        self.root_score + best.iter().skip(1).sum::<ScoreType>()
    }

    /// Verify the structural invariants of the arena
    pub fn check_invariants(&self) -> Result<(), GraphError> {
        let root = self.fragments.first().ok_or(GraphError::Empty)?;
        if root.index != ROOT || root.color != 0 || !root.incoming.is_empty() {
            return Err(GraphError::RootMisplaced);
        }
        for (i, fragment) in self.fragments.iter().enumerate() {
            if fragment.index != i {
                return Err(GraphError::IndexMismatch(i));
            }
            if i != ROOT && fragment.color == 0 {
                return Err(GraphError::RootColorReused(i));
            }
        }
        let n = self.fragments.len();
        for (i, loss) in self.losses.iter().enumerate() {
            if loss.head >= n || loss.tail >= n || loss.head == loss.tail {
                return Err(GraphError::DanglingLoss(i));
            }
            if !self.fragments[loss.head].outgoing.contains(&i)
                || !self.fragments[loss.tail].incoming.contains(&i)
            {
                return Err(GraphError::AdjacencyMismatch(i));
            }
            if self.prepared && loss.weight.is_infinite() {
                return Err(GraphError::InfiniteWeight(i));
            }
        }
        if self.prepared {
            let reachable = self.reachable(&vec![false; self.losses.len()]);
            if let Some(v) = reachable.iter().position(|r| !r) {
                return Err(GraphError::Unreachable(v));
            }
        }
        Ok(())
    }
}
