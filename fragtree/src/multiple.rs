//! Search for the best fragmentation trees over many precursor candidates.
//!
//! Graphs are produced by a [`GraphQueue`], either on the calling thread or by a
//! fixed pool of worker threads feeding a bounded channel. Trees are always computed
//! on the consuming thread, which is the only place the lowerbound and the set of
//! retained trees change.
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, trace, warn};

use crate::analysis::{FragmentationPatternAnalysis, TreeComputationError};
use crate::formula::{MolecularFormula, ScoredMolecularFormula};
use crate::graph::FragmentationGraph;
use crate::input::ProcessedInput;
use crate::scoring::ScoreType;
use crate::tree::FragmentationTree;

/// The memory one graph under construction is assumed to need
pub const GRAPH_MEMORY_ESTIMATE: u64 = 1 << 30;

type GraphResult = Result<FragmentationGraph, TreeComputationError>;

/// A configurable search over the parent candidates of one input. Every builder
/// method returns a modified copy; the terminal operations [`optimal_tree`],
/// [`list`] and [`iterator`] run the search.
///
/// [`optimal_tree`]: MultipleTreeComputation::optimal_tree
/// [`list`]: MultipleTreeComputation::list
/// [`iterator`]: MultipleTreeComputation::iterator
#[derive(Debug, Clone)]
pub struct MultipleTreeComputation {
    analysis: Arc<FragmentationPatternAnalysis>,
    input: Arc<ProcessedInput>,
    candidates: Vec<ScoredMolecularFormula>,
    lowerbound: ScoreType,
    maximal_number: usize,
    threads: usize,
    memory_budget: Option<u64>,
    recalibration: bool,
    backbones: HashMap<MolecularFormula, FragmentationTree>,
}

impl MultipleTreeComputation {
    pub fn new(analysis: Arc<FragmentationPatternAnalysis>, input: Arc<ProcessedInput>) -> Self {
        let config = analysis.config();
        Self {
            candidates: input.parent_candidates.clone(),
            lowerbound: config.lowerbound,
            maximal_number: usize::MAX,
            threads: config.threads.max(1),
            memory_budget: config.memory_budget,
            recalibration: config.recalibration,
            backbones: HashMap::new(),
            analysis,
            input,
        }
    }

    pub fn candidates(&self) -> &[ScoredMolecularFormula] {
        &self.candidates
    }

    pub fn lowerbound(&self) -> ScoreType {
        self.lowerbound
    }

    pub fn with_lowerbound(mut self, lowerbound: ScoreType) -> Self {
        self.lowerbound = lowerbound;
        self
    }

    /// Only the `maximal_number` best trees are of interest, which lets the
    /// [`TreeIterator`] raise its lowerbound as it goes.
    pub fn compute_maximal(mut self, maximal_number: usize) -> Self {
        self.maximal_number = maximal_number;
        self
    }

    pub fn in_parallel(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn in_parallel_default(self) -> Self {
        self.in_parallel(2)
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Keep only the candidates whose formula is listed
    pub fn only_with<I: IntoIterator<Item = MolecularFormula>>(mut self, formulas: I) -> Self {
        let allowed: HashSet<MolecularFormula> = formulas.into_iter().collect();
        self.candidates.retain(|c| allowed.contains(&c.formula));
        self
    }

    /// Drop the candidates whose formula is listed
    pub fn without<I: IntoIterator<Item = MolecularFormula>>(mut self, formulas: I) -> Self {
        let excluded: HashSet<MolecularFormula> = formulas.into_iter().collect();
        self.candidates.retain(|c| !excluded.contains(&c.formula));
        self
    }

    /// Replace the candidates
    pub fn with_roots<I: IntoIterator<Item = ScoredMolecularFormula>>(mut self, candidates: I) -> Self {
        self.candidates = candidates.into_iter().collect();
        self
    }

    pub fn with_recalibration(mut self, recalibration: bool) -> Self {
        self.recalibration = recalibration;
        self
    }

    /// Register known trees, keyed by their root formula, as feasible solutions for
    /// the graphs of the same candidate.
    pub fn with_backbones<I: IntoIterator<Item = FragmentationTree>>(mut self, trees: I) -> Self {
        for tree in trees {
            self.backbones.insert(tree.candidate.formula.clone(), tree);
        }
        self
    }

    /// The number of graph building threads actually used: the requested count,
    /// capped by the available parallelism, the memory budget and the number of
    /// candidates, and at least one.
    pub fn effective_threads(&self) -> usize {
        let available = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let mut threads = self.threads.min(available);
        if let Some(budget) = self.memory_budget {
            threads = threads.min((budget / GRAPH_MEMORY_ESTIMATE) as usize);
        }
        threads.min(self.candidates.len()).max(1)
    }

    fn queue(&self) -> GraphQueue {
        let threads = self.effective_threads();
        debug!(
            "Building graphs for {} candidates with {threads} thread(s)",
            self.candidates.len()
        );
        GraphQueue::new(
            self.analysis.clone(),
            self.input.clone(),
            &self.candidates,
            threads,
        )
    }

    fn tree_stage(
        &self,
        graph: &FragmentationGraph,
        lowerbound: ScoreType,
    ) -> Result<Option<FragmentationTree>, TreeComputationError> {
        let tree = self
            .analysis
            .compute_tree_with(graph, lowerbound, self.recalibration)?;
        let backbone = self
            .backbones
            .get(&graph.candidate().formula)
            .filter(|b| b.score > lowerbound);
        Ok(match (tree, backbone) {
            (Some(tree), Some(backbone)) if backbone.score > tree.score => Some(backbone.clone()),
            (None, Some(backbone)) => Some(backbone.clone()),
            (tree, _) => tree,
        })
    }

    /// The single best tree over all candidates
    pub fn optimal_tree(&self) -> Result<Option<FragmentationTree>, TreeComputationError> {
        Ok(self.list(1)?.into_iter().next())
    }

    /// Up to `max_number` of the best trees over all candidates, best first.
    ///
    /// Once `max_number` trees are retained, the worst of them becomes the
    /// lowerbound for the remaining candidates.
    pub fn list(&self, max_number: usize) -> Result<Vec<FragmentationTree>, TreeComputationError> {
        if max_number == 0 || self.candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut lowerbound = self.lowerbound;
        let mut retained = TopTrees::new(max_number);
        let mut queue = self.queue();
        while let Some(graph) = queue.next_graph() {
            let graph = graph?;
            if let Some(tree) = self.tree_stage(&graph, lowerbound)? {
                if let Some(worst) = retained.insert(tree) {
                    if worst > lowerbound {
                        trace!("Raising lowerbound from {lowerbound:0.3} to {worst:0.3}");
                        lowerbound = worst;
                    }
                }
            }
        }
        Ok(retained.into_best_first())
    }

    /// [`list`](MultipleTreeComputation::list) with the number given to
    /// [`compute_maximal`](MultipleTreeComputation::compute_maximal)
    pub fn ranked(&self) -> Result<Vec<FragmentationTree>, TreeComputationError> {
        self.list(self.maximal_number)
    }

    /// Lazily compute trees one candidate at a time, in no particular score order
    pub fn iterator(&self) -> TreeIterator<'_> {
        let scores = (self.maximal_number < self.candidates.len())
            .then(|| BestScores::new(self.maximal_number));
        TreeIterator {
            computation: self,
            queue: self.queue(),
            lowerbound: self.lowerbound,
            scores,
            last_graph: None,
            failed: false,
        }
    }
}

/// The best trees seen so far, worst first
#[derive(Debug)]
struct TopTrees {
    trees: Vec<FragmentationTree>,
    capacity: usize,
}

impl TopTrees {
    fn new(capacity: usize) -> Self {
        Self {
            trees: Vec::with_capacity(capacity.saturating_add(1).min(64)),
            capacity,
        }
    }

    /// Insert `tree`, returning the new worst score if this evicted a tree
    fn insert(&mut self, tree: FragmentationTree) -> Option<ScoreType> {
        let position = self
            .trees
            .partition_point(|t| t.cmp_by_score(&tree).is_lt());
        self.trees.insert(position, tree);
        if self.trees.len() > self.capacity {
            self.trees.remove(0);
            self.trees.first().map(|t| t.score)
        } else {
            None
        }
    }

    fn into_best_first(mut self) -> Vec<FragmentationTree> {
        self.trees.reverse();
        self.trees
    }
}

/// The `capacity` highest scores seen so far
#[derive(Debug)]
struct BestScores {
    scores: Vec<ScoreType>,
    capacity: usize,
}

impl BestScores {
    fn new(capacity: usize) -> Self {
        Self {
            scores: Vec::new(),
            capacity,
        }
    }

    fn push(&mut self, score: ScoreType) {
        let position = self.scores.partition_point(|s| *s < score);
        self.scores.insert(position, score);
        if self.scores.len() > self.capacity {
            self.scores.remove(0);
        }
    }

    /// The lowest retained score, once `capacity` scores are retained
    fn threshold(&self) -> Option<ScoreType> {
        if self.capacity > 0 && self.scores.len() >= self.capacity {
            self.scores.first().copied()
        } else {
            None
        }
    }
}

/// Lazily computes one tree per candidate, skipping candidates without a tree above
/// the current lowerbound.
///
/// The lowerbound can be inspected and changed between calls to `next`.
pub struct TreeIterator<'a> {
    computation: &'a MultipleTreeComputation,
    queue: GraphQueue,
    lowerbound: ScoreType,
    scores: Option<BestScores>,
    last_graph: Option<FragmentationGraph>,
    failed: bool,
}

impl TreeIterator<'_> {
    pub fn lowerbound(&self) -> ScoreType {
        self.lowerbound
    }

    pub fn set_lowerbound(&mut self, lowerbound: ScoreType) {
        self.lowerbound = lowerbound;
    }

    /// The graph of the candidate most recently processed
    pub fn last_graph(&self) -> Option<&FragmentationGraph> {
        self.last_graph.as_ref()
    }
}

impl Iterator for TreeIterator<'_> {
    type Item = Result<FragmentationTree, TreeComputationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while let Some(graph) = self.queue.next_graph() {
            let graph = match graph {
                Ok(graph) => graph,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            let tree = self.computation.tree_stage(&graph, self.lowerbound);
            self.last_graph = Some(graph);
            match tree {
                Ok(Some(tree)) => {
                    if let Some(scores) = self.scores.as_mut() {
                        scores.push(tree.score);
                        if let Some(threshold) = scores.threshold() {
                            self.lowerbound = self.lowerbound.max(threshold);
                        }
                    }
                    return Some(Ok(tree));
                }
                Ok(None) => {}
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        self.last_graph = None;
        None
    }
}

/// Produces the graphs of a list of candidates, in candidate order when serial
enum GraphQueue {
    Serial {
        analysis: Arc<FragmentationPatternAnalysis>,
        input: Arc<ProcessedInput>,
        stack: Vec<ScoredMolecularFormula>,
    },
    Threaded {
        receiver: Option<Receiver<GraphResult>>,
        workers: Vec<JoinHandle<()>>,
    },
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl GraphQueue {
    fn new(
        analysis: Arc<FragmentationPatternAnalysis>,
        input: Arc<ProcessedInput>,
        candidates: &[ScoredMolecularFormula],
        threads: usize,
    ) -> Self {
        let stack: Vec<ScoredMolecularFormula> = candidates.iter().rev().cloned().collect();
        if threads <= 1 {
            return Self::Serial {
                analysis,
                input,
                stack,
            };
        }
        let stack = Arc::new(Mutex::new(stack));
        let (sender, receiver) = bounded(threads);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let stack = stack.clone();
            let sender = sender.clone();
            let analysis = analysis.clone();
            let input = input.clone();
            let spawned = thread::Builder::new()
                .name(format!("fragtree-graph-{i}"))
                .spawn(move || loop {
                    let candidate = stack
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop();
                    let Some(candidate) = candidate else {
                        break;
                    };
                    let graph = analysis.build_graph(&input, &candidate);
                    if sender.send(graph).is_err() {
                        break;
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("Failed to spawn graph building thread {i}: {e}"),
            }
        }
        drop(sender);
        if workers.is_empty() {
            let stack = std::mem::take(&mut *stack.lock().unwrap_or_else(PoisonError::into_inner));
            return Self::Serial {
                analysis,
                input,
                stack,
            };
        }
        Self::Threaded {
            receiver: Some(receiver),
            workers,
        }
    }

    fn next_graph(&mut self) -> Option<GraphResult> {
        match self {
            Self::Serial {
                analysis,
                input,
                stack,
            } => {
                let candidate = stack.pop()?;
                Some(analysis.build_graph(input, &candidate))
            }
            Self::Threaded { receiver, workers } => {
                let rx = receiver.as_ref()?;
                if let Ok(graph) = rx.recv() {
                    return Some(graph);
                }
                // Every worker has hung up
                receiver.take();
                let failures: Vec<String> = workers
                    .drain(..)
                    .filter_map(|handle| handle.join().err())
                    .map(|payload| panic_message(payload.as_ref()))
                    .collect();
                if failures.is_empty() {
                    None
                } else {
                    Some(Err(TreeComputationError::WorkerFailed(failures.join("; "))))
                }
            }
        }
    }
}

impl Drop for GraphQueue {
    fn drop(&mut self) {
        if let Self::Threaded { receiver, workers } = self {
            receiver.take();
            for handle in workers.drain(..) {
                if let Err(payload) = handle.join() {
                    warn!(
                        "Graph building thread failed: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::graph::GraphBuilder;
    use crate::input::ProcessedPeak;
    use crate::scoring::GraphScoring;
    use crate::tree_builder::DPTreeBuilder;

    fn tree(formula: &str, score: ScoreType) -> FragmentationTree {
        FragmentationTree::new(formula.parse::<MolecularFormula>().unwrap().into(), 0, score)
    }

    #[test]
    fn test_top_trees() {
        let mut top = TopTrees::new(2);
        assert_eq!(top.insert(tree("C6H12O6", 6.0)), None);
        assert_eq!(top.insert(tree("C7H16O5", 10.0)), None);
        assert_eq!(top.insert(tree("C5H8N4O3", 2.0)), Some(6.0));
        assert_eq!(top.insert(tree("C8H4O5", 8.0)), Some(8.0));
        let scores: Vec<_> = top.into_best_first().iter().map(|t| t.score).collect();
        assert_eq!(scores, vec![10.0, 8.0]);
    }

    #[test]
    fn test_top_trees_keep_ties() {
        let mut top = TopTrees::new(3);
        top.insert(tree("C6H12O6", 4.0));
        top.insert(tree("C7H16O5", 4.0));
        assert_eq!(top.into_best_first().len(), 2);
    }

    #[derive(Debug)]
    struct PanickingBuilder;

    impl GraphBuilder for PanickingBuilder {
        fn build_graph(
            &self,
            input: &Arc<ProcessedInput>,
            candidate: &ScoredMolecularFormula,
        ) -> FragmentationGraph {
            if candidate.formula.to_string() == "C7H16O5" {
                panic!("cannot build {}", candidate.formula);
            }
            FragmentationGraph::new(input.clone(), candidate.clone())
        }
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let analysis = Arc::new(FragmentationPatternAnalysis::with_components(
            AnalysisConfig::default(),
            Box::new(PanickingBuilder),
            GraphScoring::new(),
            Box::new(DPTreeBuilder::default()),
        ));
        let input = Arc::new(ProcessedInput::new(
            Default::default(),
            vec![ProcessedPeak::new(0, 181.07, 1.0)],
            0,
            vec![],
        ));
        let candidates: Vec<ScoredMolecularFormula> = ["C6H12O6", "C7H16O5", "C8H4O5"]
            .iter()
            .map(|s| s.parse::<MolecularFormula>().unwrap().into())
            .collect();

        let mut queue = GraphQueue::new(analysis, input, &candidates, 2);
        assert!(matches!(queue, GraphQueue::Threaded { .. }));
        let mut built = 0;
        let mut failure = None;
        while let Some(graph) = queue.next_graph() {
            match graph {
                Ok(_) => built += 1,
                Err(e) => failure = Some(e),
            }
        }
        assert_eq!(built, 2);
        match failure {
            Some(TreeComputationError::WorkerFailed(message)) => {
                assert!(message.contains("cannot build C7H16O5"), "{message}")
            }
            other => panic!("expected a worker failure, got {other:?}"),
        }
        assert!(queue.next_graph().is_none());
    }

    #[test]
    fn test_best_scores() {
        let mut scores = BestScores::new(2);
        scores.push(3.0);
        assert_eq!(scores.threshold(), None);
        scores.push(1.0);
        assert_eq!(scores.threshold(), Some(1.0));
        scores.push(5.0);
        assert_eq!(scores.threshold(), Some(3.0));
    }
}
