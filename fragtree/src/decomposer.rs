//! Mass decomposition: enumerating the formulas over an alphabet that match a mass.
//!
//! Initializing a decomposer for an alphabet is the expensive part, so
//! [`DecomposerCache`] keeps a small number of initialized decomposers around and
//! evicts the least frequently used one when it runs out of room.
use mzpeaks::Tolerance;
use tracing::debug;

use crate::formula::{ChemicalAlphabet, ElementSpec, MolecularFormula};
use crate::input::ExperimentInfo;

/// The default number of initialized decomposers a cache keeps
pub const DEFAULT_CACHE_CAPACITY: usize = 5;

/// Produces candidate formulas for a mass, given an initialized state for an alphabet
pub trait Decomposer {
    type State: std::fmt::Debug;

    fn initialize(&self, alphabet: &ChemicalAlphabet, info: &ExperimentInfo) -> Self::State;

    fn decompose(
        &self,
        state: &Self::State,
        mass: f64,
        tolerance: Tolerance,
    ) -> Vec<MolecularFormula>;

    /// Whether an initialized state can still serve requests for `alphabet`
    fn alphabet_still_valid(&self, state: &Self::State, alphabet: &ChemicalAlphabet) -> bool;
}

#[derive(Debug)]
struct CacheSlot<S> {
    alphabet: ChemicalAlphabet,
    state: S,
    uses: u64,
}

/// A bounded, least-frequently-used cache of initialized decomposer states keyed by
/// alphabet.
///
/// Not thread-safe; callers sharing a cache across threads wrap it in a lock.
#[derive(Debug)]
pub struct DecomposerCache<D: Decomposer> {
    decomposer: D,
    slots: Vec<CacheSlot<D::State>>,
    capacity: usize,
}

impl<D: Decomposer + Default> Default for DecomposerCache<D> {
    fn default() -> Self {
        Self::new(D::default(), DEFAULT_CACHE_CAPACITY)
    }
}

impl<D: Decomposer> DecomposerCache<D> {
    pub fn new(decomposer: D, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            decomposer,
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn decomposer(&self) -> &D {
        &self.decomposer
    }

    /// The alphabets currently held, in slot order
    pub fn alphabets(&self) -> impl Iterator<Item = &ChemicalAlphabet> + '_ {
        self.slots.iter().map(|s| &s.alphabet)
    }

    /// Fetch the initialized state for `alphabet`, creating it if needed. When the
    /// cache is full, the slot with the fewest uses is replaced, the earliest such slot
    /// on ties.
    pub fn get(&mut self, alphabet: &ChemicalAlphabet, info: &ExperimentInfo) -> &D::State {
        let index = match self.slots.iter().position(|s| &s.alphabet == alphabet) {
            Some(i) => {
                if !self
                    .decomposer
                    .alphabet_still_valid(&self.slots[i].state, alphabet)
                {
                    self.slots[i].state = self.decomposer.initialize(alphabet, info);
                }
                i
            }
            None => {
                let slot = CacheSlot {
                    alphabet: alphabet.clone(),
                    state: self.decomposer.initialize(alphabet, info),
                    uses: 0,
                };
                if self.slots.len() < self.capacity {
                    self.slots.push(slot);
                    self.slots.len() - 1
                } else {
                    let mut victim = 0;
                    for (i, s) in self.slots.iter().enumerate() {
                        if s.uses < self.slots[victim].uses {
                            victim = i;
                        }
                    }
                    debug!(
                        "Evicting decomposer for {} ({} uses) in favor of {}",
                        self.slots[victim].alphabet, self.slots[victim].uses, alphabet
                    );
                    self.slots[victim] = slot;
                    victim
                }
            }
        };
        let slot = &mut self.slots[index];
        slot.uses += 1;
        &slot.state
    }

    /// Decompose `mass` over `alphabet`, initializing a decomposer if needed
    pub fn decompose(
        &mut self,
        alphabet: &ChemicalAlphabet,
        mass: f64,
        tolerance: Tolerance,
        info: &ExperimentInfo,
    ) -> Vec<MolecularFormula> {
        self.get(alphabet, info);
        let Some(slot) = self.slots.iter().find(|s| &s.alphabet == alphabet) else {
            return Vec::new();
        };
        self.decomposer.decompose(&slot.state, mass, tolerance)
    }
}

/// Initialized state of a [`MassDecomposer`]: the alphabet's elements with their
/// masses, heaviest first.
#[derive(Debug, Clone)]
pub struct MassDecomposerState {
    alphabet: ChemicalAlphabet,
    elements: Vec<(ElementSpec, f64)>,
}

/// Enumerates every formula within a mass window by depth-first search over element
/// counts, heaviest element first, pruning branches that overshoot the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassDecomposer {
    /// Formulas with an RDBE below this value are discarded
    pub min_rdbe: Option<f64>,
    pub max_atoms: i32,
}

impl Default for MassDecomposer {
    fn default() -> Self {
        Self {
            min_rdbe: Some(-0.5),
            max_atoms: 200,
        }
    }
}

impl MassDecomposer {
    #[allow(clippy::too_many_arguments)]
    fn search(
        &self,
        state: &MassDecomposerState,
        element: usize,
        partial_mass: f64,
        atoms: i32,
        counts: &mut Vec<(ElementSpec, i32)>,
        window: (f64, f64),
        target: f64,
        tolerance: Tolerance,
        found: &mut Vec<MolecularFormula>,
    ) {
        if element == state.elements.len() {
            if partial_mass >= window.0 && partial_mass <= window.1 && atoms > 0 {
                let formula = MolecularFormula::new(counts.iter().copied());
                if tolerance.test(formula.mass(), target)
                    && self.min_rdbe.map_or(true, |r| formula.rdbe() >= r)
                {
                    found.push(formula);
                }
            }
            return;
        }
        let (spec, mass) = state.elements[element];
        let room = ((window.1 - partial_mass) / mass).floor().max(0.0) as i32;
        let limit = room.min(self.max_atoms - atoms);
        for count in 0..=limit {
            if count > 0 {
                counts.push((spec, count));
            }
            self.search(
                state,
                element + 1,
                partial_mass + mass * count as f64,
                atoms + count,
                counts,
                window,
                target,
                tolerance,
                found,
            );
            if count > 0 {
                counts.pop();
            }
        }
    }
}

impl Decomposer for MassDecomposer {
    type State = MassDecomposerState;

    fn initialize(&self, alphabet: &ChemicalAlphabet, _info: &ExperimentInfo) -> Self::State {
        let mut elements: Vec<(ElementSpec, f64)> = alphabet
            .elements()
            .iter()
            .map(|e| (*e, MolecularFormula::new([(*e, 1)]).mass()))
            .collect();
        elements.sort_by(|a, b| b.1.total_cmp(&a.1));
        MassDecomposerState {
            alphabet: alphabet.clone(),
            elements,
        }
    }

    fn decompose(
        &self,
        state: &Self::State,
        mass: f64,
        tolerance: Tolerance,
    ) -> Vec<MolecularFormula> {
        let window = tolerance.bounds(mass);
        let mut found = Vec::new();
        let mut counts = Vec::with_capacity(state.elements.len());
        self.search(state, 0, 0.0, 0, &mut counts, window, mass, tolerance, &mut found);
        found.sort();
        found
    }

    fn alphabet_still_valid(&self, state: &Self::State, alphabet: &ChemicalAlphabet) -> bool {
        &state.alphabet == alphabet
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingDecomposer {
        initialized: Cell<usize>,
    }

    impl Decomposer for CountingDecomposer {
        type State = ChemicalAlphabet;

        fn initialize(&self, alphabet: &ChemicalAlphabet, _info: &ExperimentInfo) -> Self::State {
            self.initialized.set(self.initialized.get() + 1);
            alphabet.clone()
        }

        fn decompose(
            &self,
            _state: &Self::State,
            _mass: f64,
            _tolerance: Tolerance,
        ) -> Vec<MolecularFormula> {
            Vec::new()
        }

        fn alphabet_still_valid(&self, state: &Self::State, alphabet: &ChemicalAlphabet) -> bool {
            state == alphabet
        }
    }

    fn alphabet(s: &str) -> ChemicalAlphabet {
        ChemicalAlphabet::parse(s).unwrap()
    }

    #[test]
    fn test_cache_hits_do_not_reinitialize() {
        let mut cache = DecomposerCache::new(CountingDecomposer::default(), 2);
        let info = ExperimentInfo::default();
        cache.get(&alphabet("CHO"), &info);
        cache.get(&alphabet("CHO"), &info);
        cache.get(&alphabet("CHNO"), &info);
        assert_eq!(cache.decomposer().initialized.get(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_evicts_least_used() {
        let mut cache = DecomposerCache::new(CountingDecomposer::default(), 2);
        let info = ExperimentInfo::default();
        for _ in 0..3 {
            cache.get(&alphabet("CHO"), &info);
        }
        cache.get(&alphabet("CHNO"), &info);
        cache.get(&alphabet("CHNOPS"), &info);
        let held: Vec<_> = cache.alphabets().cloned().collect();
        assert_eq!(held, vec![alphabet("CHO"), alphabet("CHNOPS")]);

        // Ties go to the earliest slot
        let mut cache = DecomposerCache::new(CountingDecomposer::default(), 2);
        cache.get(&alphabet("CHO"), &info);
        cache.get(&alphabet("CHNO"), &info);
        cache.get(&alphabet("CHNOS"), &info);
        let held: Vec<_> = cache.alphabets().cloned().collect();
        assert_eq!(held, vec![alphabet("CHNOS"), alphabet("CHNO")]);
    }

    #[test]
    fn test_cache_never_exceeds_capacity() {
        let mut cache = DecomposerCache::new(CountingDecomposer::default(), DEFAULT_CACHE_CAPACITY);
        let info = ExperimentInfo::default();
        let alphabets = ["CH", "CHO", "CHN", "CHNO", "CHNOP", "CHNOS", "CHNOPS", "CHCl", "CHOCl"];
        for (i, a) in alphabets.iter().cycle().take(40).enumerate() {
            cache.get(&alphabet(a), &info);
            assert!(cache.len() <= DEFAULT_CACHE_CAPACITY, "at step {i}");
        }
    }

    #[test]
    fn test_mass_decomposer() {
        let mut cache: DecomposerCache<MassDecomposer> = DecomposerCache::default();
        let info = ExperimentInfo::default();
        let glucose: MolecularFormula = "C6H12O6".parse().unwrap();
        let found = cache.decompose(
            &alphabet("CHNO"),
            glucose.mass(),
            Tolerance::PPM(5.0),
            &info,
        );
        assert!(found.contains(&glucose), "{found:?}");
        for formula in found.iter() {
            assert!(Tolerance::PPM(5.0).test(formula.mass(), glucose.mass()));
        }
        let water: MolecularFormula = "H2O".parse().unwrap();
        let found = cache.decompose(&alphabet("CHNO"), water.mass(), Tolerance::PPM(5.0), &info);
        assert_eq!(found, vec![water]);
        assert_eq!(cache.len(), 1);
    }
}
