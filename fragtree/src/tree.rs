//! Fragmentation trees, the colorful subtrees selected from a [`FragmentationGraph`](crate::graph::FragmentationGraph).
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::formula::{MolecularFormula, ScoredMolecularFormula};
use crate::scoring::ScoreType;

/// The edge connecting a tree fragment to its parent
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeLoss {
    /// Index of the parent fragment in the tree
    pub parent: usize,
    pub formula: MolecularFormula,
    pub weight: ScoreType,
}

/// A fragment of a tree: one formula explaining one peak
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeFragment {
    pub index: usize,
    pub formula: MolecularFormula,
    pub peak: usize,
    pub color: usize,
    pub incoming: Option<TreeLoss>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub children: Vec<usize>,
}

impl TreeFragment {
    pub fn is_root(&self) -> bool {
        self.incoming.is_none()
    }

    pub fn parent(&self) -> Option<usize> {
        self.incoming.as_ref().map(|l| l.parent)
    }
}

/// A rooted tree of fragments, at most one per color. The root is at index `0`.
///
/// The score of a tree is the root score plus the weights of all of its edges.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FragmentationTree {
    pub candidate: ScoredMolecularFormula,
    pub root_score: ScoreType,
    pub score: ScoreType,
    fragments: Vec<TreeFragment>,
}

impl FragmentationTree {
    pub fn new(candidate: ScoredMolecularFormula, peak: usize, root_score: ScoreType) -> Self {
        let root = TreeFragment {
            index: 0,
            formula: candidate.formula.clone(),
            peak,
            color: 0,
            incoming: None,
            children: Vec::new(),
        };
        Self {
            candidate,
            root_score,
            score: root_score,
            fragments: vec![root],
        }
    }

    /// Attach a new fragment below `parent`, adding `weight` to the tree score
    pub fn add_fragment(
        &mut self,
        parent: usize,
        formula: MolecularFormula,
        peak: usize,
        color: usize,
        loss: MolecularFormula,
        weight: ScoreType,
    ) -> usize {
        let index = self.fragments.len();
        self.fragments.push(TreeFragment {
            index,
            formula,
            peak,
            color,
            incoming: Some(TreeLoss {
                parent,
                formula: loss,
                weight,
            }),
            children: Vec::new(),
        });
        self.fragments[parent].children.push(index);
        self.score += weight;
        index
    }

    pub fn root(&self) -> &TreeFragment {
        &self.fragments[0]
    }

    pub fn fragments(&self) -> &[TreeFragment] {
        &self.fragments
    }

    pub fn fragment(&self, index: usize) -> &TreeFragment {
        &self.fragments[index]
    }

    pub fn number_of_vertices(&self) -> usize {
        self.fragments.len()
    }

    pub fn number_of_edges(&self) -> usize {
        self.fragments.len() - 1
    }

    pub fn losses(&self) -> impl Iterator<Item = (usize, &TreeLoss)> + '_ {
        self.fragments
            .iter()
            .filter_map(|f| f.incoming.as_ref().map(|l| (f.index, l)))
    }

    /// Recompute the score from the root score and edge weights
    pub fn recompute_score(&self) -> ScoreType {
        self.root_score + self.losses().map(|(_, l)| l.weight).sum::<ScoreType>()
    }

    /// Whether no two fragments share a color
    pub fn is_colorful(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.fragments.len());
        self.fragments.iter().all(|f| seen.insert(f.color))
    }

    /// Whether no two fragments explain the same peak
    pub fn explains_each_peak_once(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.fragments.len());
        self.fragments.iter().all(|f| seen.insert(f.peak))
    }

    /// Order trees by score, breaking ties on the candidate formula so that distinct
    /// candidates with equal scores are never considered equal.
    pub fn cmp_by_score(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.candidate.formula.cmp_atoms(&other.candidate.formula))
    }
}
