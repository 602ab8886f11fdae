use tracing::{trace, warn};

use crate::graph::{FragmentationGraph, ROOT};
use crate::input::ProcessedInput;
use crate::scoring::ScoreType;
use crate::tree::FragmentationTree;

use super::{accept, attach_greedily, ensure_prepared, TreeBuilder, TreeBuilderError, VertexMap};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Choice {
    /// The vertex is a leaf for this color set
    Empty,
    /// Hang the subtree of this loss's tail below the vertex
    Edge(usize),
    /// Combine two subtrees rooted at the same vertex over disjoint color sets
    Split(usize),
}

/// Exact maximum colorful subtree by dynamic programming over color subsets.
///
/// For every vertex `v` and set of colors `S`, `best(v, S)` is the maximum weight of a
/// subtree rooted at `v` using only colors from `S`:
///
/// ```text
/// best(v, S) = max(0,
///                  max over edges v->u with color(u) in S:  best(u, S \ {color(u)}) + w(v, u),
///                  max over partitions S = T ∪ U:            best(v, T) + best(v, U))
/// ```
///
/// Time and memory grow with `2^k` for `k` colors, so only the `max_colors` best-ranked
/// colors take part in the exact search, and never more than [`MAX_EXACT_COLORS`].
/// Vertices of the remaining colors are attached greedily afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DPTreeBuilder {
    pub max_colors: usize,
}

impl Default for DPTreeBuilder {
    fn default() -> Self {
        Self { max_colors: 10 }
    }
}

/// The most colors the exact search will cover
pub const MAX_EXACT_COLORS: usize = 16;

impl DPTreeBuilder {
    pub fn new(max_colors: usize) -> Self {
        if max_colors > MAX_EXACT_COLORS {
            warn!("Limiting the exact tree search from {max_colors} to {MAX_EXACT_COLORS} colors");
        }
        Self {
            max_colors: max_colors.min(MAX_EXACT_COLORS),
        }
    }

    /// The number of colors the exact search covers in `graph`, excluding the root's
    pub fn exact_colors(&self, graph: &FragmentationGraph) -> usize {
        self.max_colors
            .min(MAX_EXACT_COLORS)
            .min(graph.number_of_colors().saturating_sub(1))
    }
}

struct Table {
    scores: Vec<ScoreType>,
    choices: Vec<Choice>,
}

impl TreeBuilder for DPTreeBuilder {
    fn build_tree(
        &self,
        _input: &ProcessedInput,
        graph: &FragmentationGraph,
        lowerbound: ScoreType,
    ) -> Result<Option<FragmentationTree>, TreeBuilderError> {
        ensure_prepared(graph)?;
        let k = self.exact_colors(graph);
        let size = 1usize << k;
        let full = size - 1;
        let color_bit = |vertex: usize| {
            let color = graph.fragment(vertex).color;
            if color == 0 || color > k {
                0
            } else {
                1usize << (color - 1)
            }
        };

        let order = graph.vertices_in_post_order(k);
        let mut slot = vec![usize::MAX; graph.number_of_vertices()];
        let mut tables: Vec<Table> = Vec::with_capacity(order.len());
        for &v in order.iter() {
            let own_bit = color_bit(v);
            let children: Vec<(usize, usize, usize)> = graph
                .fragment(v)
                .outgoing()
                .iter()
                .filter_map(|&l| {
                    let tail = graph.loss(l).tail;
                    let child_slot = slot[tail];
                    (child_slot != usize::MAX).then(|| (l, child_slot, color_bit(tail)))
                })
                .collect();
            let mut scores = vec![0.0; size];
            let mut choices = vec![Choice::Empty; size];
            for s in 1..size {
                if s & own_bit != 0 {
                    continue;
                }
                let mut best = 0.0;
                let mut choice = Choice::Empty;
                for &(l, child_slot, bit) in children.iter() {
                    if s & bit == 0 {
                        continue;
                    }
                    let candidate = tables[child_slot].scores[s ^ bit] + graph.loss(l).weight;
                    if candidate > best {
                        best = candidate;
                        choice = Choice::Edge(l);
                    }
                }
                if children.len() > 1 {
                    let lowest = s & s.wrapping_neg();
                    let mut sub = (s - 1) & s;
                    while sub > 0 {
                        if sub & lowest != 0 {
                            let candidate = scores[sub] + scores[s ^ sub];
                            if candidate > best {
                                best = candidate;
                                choice = Choice::Split(sub);
                            }
                        }
                        sub = (sub - 1) & s;
                    }
                }
                scores[s] = best;
                choices[s] = choice;
            }
            slot[v] = tables.len();
            tables.push(Table { scores, choices });
        }

        let root = graph.root();
        let mut tree =
            FragmentationTree::new(graph.candidate().clone(), root.peak, graph.root_score());
        let mut in_tree = VertexMap::default();
        in_tree.insert(ROOT, 0);
        let mut used_colors = vec![false; graph.number_of_colors()];
        used_colors[0] = true;

        let mut work = vec![(ROOT, full, 0usize)];
        while let Some((vertex, colors, tree_index)) = work.pop() {
            match tables[slot[vertex]].choices[colors] {
                Choice::Empty => {}
                Choice::Edge(l) => {
                    let loss = graph.loss(l);
                    let child = graph.fragment(loss.tail);
                    let child_index = tree.add_fragment(
                        tree_index,
                        child.formula().clone(),
                        child.peak,
                        child.color,
                        loss.formula.clone(),
                        loss.weight,
                    );
                    in_tree.insert(loss.tail, child_index);
                    used_colors[child.color] = true;
                    work.push((loss.tail, colors ^ color_bit(loss.tail), child_index));
                }
                Choice::Split(sub) => {
                    work.push((vertex, sub, tree_index));
                    work.push((vertex, colors ^ sub, tree_index));
                }
            }
        }
        trace!(
            "Exact search over {k} colors scored {:0.3}, {} of {} colors remain",
            tables[slot[ROOT]].scores[full],
            graph.number_of_colors() - 1 - k,
            graph.number_of_colors() - 1,
        );

        if k + 1 < graph.number_of_colors() {
            attach_greedily(graph, &mut tree, &mut in_tree, &mut used_colors);
        }
        accept(tree, lowerbound)
    }

    fn description(&self) -> &'static str {
        "dynamic programming"
    }
}
