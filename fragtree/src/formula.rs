//! Molecular formulas, chemical alphabets and scored formula candidates.
//!
//! A [`MolecularFormula`] is a canonical, sorted list of element counts with its
//! monoisotopic mass computed once on construction. Formulas are compared and hashed
//! by their element counts only.
use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::hash::Hash;
use std::str::FromStr;

use chemical_elements::{ChemicalComposition, ElementSpecification};
use itertools::Itertools;
use thiserror::Error;

use crate::scoring::ScoreType;

/// The element specification type used throughout the crate
pub type ElementSpec = ElementSpecification<'static>;

/// An error that might occur while reading or combining formulas
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("Unknown element symbol {0:?}")]
    UnknownElement(String),
    #[error("Malformed formula {0:?} at position {1}")]
    Malformed(String, usize),
    #[error("Element count overflowed in {0:?}")]
    CountOverflow(String),
}

fn element_symbol(element: &ElementSpec) -> &str {
    element.element.symbol.as_str()
}

fn element_order(a: &ElementSpec, b: &ElementSpec) -> Ordering {
    element_symbol(a)
        .cmp(element_symbol(b))
        .then(a.isotope.cmp(&b.isotope))
}

fn write_element(f: &mut fmt::Formatter<'_>, element: &ElementSpec, count: i32) -> fmt::Result {
    if element.isotope == 0 {
        f.write_str(element_symbol(element))?;
    } else {
        write!(f, "{}[{}]", element_symbol(element), element.isotope)?;
    }
    if count != 1 {
        write!(f, "{count}")?;
    }
    Ok(())
}

/// Look up an element by its symbol, e.g. `"C"` or `"C[13]"`
pub fn parse_element(symbol: &str) -> Result<ElementSpec, FormulaError> {
    ElementSpecification::parse(symbol).map_err(|_| FormulaError::UnknownElement(symbol.to_string()))
}

/// The valence used to compute the ring-double-bond-equivalent of a formula.
///
/// Elements not listed here are treated as divalent, so they do not change the RDBE.
fn valence(symbol: &str) -> i32 {
    match symbol {
        "H" | "F" | "Cl" | "Br" | "I" | "Na" | "K" | "Li" => 1,
        "O" | "S" | "Se" => 2,
        "N" | "P" | "B" | "As" => 3,
        "C" | "Si" => 4,
        _ => 2,
    }
}

/// A neutral molecular formula.
#[derive(Debug, Clone, Default)]
pub struct MolecularFormula {
    atoms: Vec<(ElementSpec, i32)>,
    mass: f64,
}

impl PartialEq for MolecularFormula {
    fn eq(&self, other: &Self) -> bool {
        self.atoms == other.atoms
    }
}

impl Eq for MolecularFormula {}

impl Hash for MolecularFormula {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.atoms.hash(state)
    }
}

impl PartialOrd for MolecularFormula {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MolecularFormula {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mass
            .total_cmp(&other.mass)
            .then_with(|| self.cmp_atoms(other))
    }
}

impl MolecularFormula {
    /// Build a formula from element counts. Repeated elements are merged and elements
    /// with a zero count are dropped.
    pub fn new<I: IntoIterator<Item = (ElementSpec, i32)>>(atoms: I) -> Self {
        let mut atoms: Vec<_> = atoms.into_iter().collect();
        atoms.sort_by(|(a, _), (b, _)| element_order(a, b));
        let atoms: Vec<_> = atoms
            .into_iter()
            .coalesce(|(a, ca), (b, cb)| {
                if element_order(&a, &b).is_eq() {
                    Ok((a, ca + cb))
                } else {
                    Err(((a, ca), (b, cb)))
                }
            })
            .filter(|(_, c)| *c != 0)
            .collect();
        Self::from_sorted(atoms)
    }

    fn from_sorted(atoms: Vec<(ElementSpec, i32)>) -> Self {
        let mut composition = ChemicalComposition::new();
        for (element, count) in atoms.iter() {
            composition.set(*element, *count);
        }
        let mass = composition.mass();
        Self { atoms, mass }
    }

    /// Compare element counts pairwise: symbol, then isotope, then count. Equal only
    /// for equal formulas.
    pub fn cmp_atoms(&self, other: &Self) -> Ordering {
        for ((a, ca), (b, cb)) in self.atoms.iter().zip(other.atoms.iter()) {
            let order = element_order(a, b).then(ca.cmp(cb));
            if order.is_ne() {
                return order;
            }
        }
        self.atoms.len().cmp(&other.atoms.len())
    }

    /// The formula with no atoms
    pub fn empty() -> Self {
        Self::default()
    }

    /// The monoisotopic mass of the formula
    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (ElementSpec, i32)> {
        self.atoms.iter()
    }

    /// The count of the element with the given (natural isotope) symbol
    pub fn count_of(&self, symbol: &str) -> i32 {
        self.atoms
            .iter()
            .find(|(e, _)| element_symbol(e) == symbol && e.isotope == 0)
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }

    pub fn atom_count(&self) -> i32 {
        self.atoms.iter().map(|(_, c)| *c).sum()
    }

    /// The number of atoms which are neither carbon nor hydrogen
    pub fn hetero_atom_count(&self) -> i32 {
        self.atoms
            .iter()
            .filter(|(e, _)| !matches!(element_symbol(e), "C" | "H"))
            .map(|(_, c)| *c)
            .sum()
    }

    /// Ring-double-bond-equivalent, `1 + Σ count * (valence - 2) / 2`
    pub fn rdbe(&self) -> f64 {
        let doubled: i32 = self
            .atoms
            .iter()
            .map(|(e, c)| c * (valence(element_symbol(e)) - 2))
            .sum();
        1.0 + doubled as f64 / 2.0
    }

    /// Whether this formula has an odd number of electrons as a neutral species
    pub fn is_radical(&self) -> bool {
        let doubled: i32 = self
            .atoms
            .iter()
            .map(|(e, c)| c * (valence(element_symbol(e)) - 2))
            .sum();
        doubled.rem_euclid(2) != 0
    }

    /// The chemical alphabet this formula is written in
    pub fn alphabet(&self) -> ChemicalAlphabet {
        ChemicalAlphabet::new(self.atoms.iter().map(|(e, _)| *e))
    }

    /// Whether every element count of `other` is at most the count in `self`
    pub fn contains(&self, other: &MolecularFormula) -> bool {
        let mut mine = self.atoms.iter().peekable();
        for (e, c) in other.atoms.iter() {
            loop {
                match mine.peek() {
                    Some((m, _)) if element_order(m, e).is_lt() => {
                        mine.next();
                    }
                    Some((m, mc)) if element_order(m, e).is_eq() => {
                        if mc < c {
                            return false;
                        }
                        break;
                    }
                    _ => {
                        if *c > 0 {
                            return false;
                        }
                        break;
                    }
                }
            }
        }
        true
    }

    /// Subtract `other`, returning `None` if any count would become negative
    pub fn checked_sub(&self, other: &MolecularFormula) -> Option<MolecularFormula> {
        let merged = self.merge_with(other, -1);
        if merged.iter().any(|(_, c)| *c < 0) {
            None
        } else {
            Some(Self::from_sorted(merged))
        }
    }

    fn merge_with(&self, other: &MolecularFormula, sign: i32) -> Vec<(ElementSpec, i32)> {
        self.atoms
            .iter()
            .merge_join_by(other.atoms.iter(), |(a, _), (b, _)| element_order(a, b))
            .filter_map(|pair| {
                let (e, c) = match pair {
                    itertools::EitherOrBoth::Both((e, a), (_, b)) => (*e, a + sign * b),
                    itertools::EitherOrBoth::Left((e, a)) => (*e, *a),
                    itertools::EitherOrBoth::Right((e, b)) => (*e, sign * b),
                };
                (c != 0).then_some((e, c))
            })
            .collect()
    }

    /// Add the atoms of `other` to this formula
    pub fn add(&self, other: &MolecularFormula) -> MolecularFormula {
        Self::from_sorted(self.merge_with(other, 1))
    }
}

impl Display for MolecularFormula {
    /// Hill notation, carbon then hydrogen then the remaining elements alphabetically
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let has_carbon = self.count_of("C") > 0;
        let rank = |e: &ElementSpec| match (has_carbon, element_symbol(e)) {
            (true, "C") => 0,
            (true, "H") => 1,
            _ => 2,
        };
        for (e, c) in self
            .atoms
            .iter()
            .sorted_by(|(a, _), (b, _)| rank(a).cmp(&rank(b)).then(element_order(a, b)))
        {
            write_element(f, e, *c)?;
        }
        Ok(())
    }
}

impl FromStr for MolecularFormula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let mut atoms = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i].is_ascii_whitespace() {
                i += 1;
                continue;
            }
            if !bytes[i].is_ascii_uppercase() {
                return Err(FormulaError::Malformed(s.to_string(), i));
            }
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_lowercase() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'[' {
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                if i == bytes.len() {
                    return Err(FormulaError::Malformed(s.to_string(), start));
                }
                i += 1;
            }
            let element = parse_element(&s[start..i])?;
            let count_start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let count = if count_start == i {
                1
            } else {
                s[count_start..i]
                    .parse::<i32>()
                    .map_err(|_| FormulaError::CountOverflow(s.to_string()))?
            };
            atoms.push((element, count));
        }
        Ok(Self::new(atoms))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for MolecularFormula {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for MolecularFormula {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// The set of elements a decomposer may use
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChemicalAlphabet {
    elements: Vec<ElementSpec>,
}

impl ChemicalAlphabet {
    pub fn new<I: IntoIterator<Item = ElementSpec>>(elements: I) -> Self {
        let mut elements: Vec<_> = elements.into_iter().collect();
        elements.sort_by(element_order);
        elements.dedup_by(|a, b| element_order(a, b).is_eq());
        Self { elements }
    }

    /// Parse an alphabet written as concatenated symbols, e.g. `"CHNOPS"`
    pub fn parse(symbols: &str) -> Result<Self, FormulaError> {
        let formula: MolecularFormula = symbols.parse()?;
        Ok(formula.alphabet())
    }

    pub fn elements(&self) -> &[ElementSpec] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Whether every element of `formula` is in this alphabet
    pub fn admits(&self, formula: &MolecularFormula) -> bool {
        formula
            .iter()
            .all(|(e, _)| self.elements.iter().any(|a| element_order(a, e).is_eq()))
    }
}

impl Display for ChemicalAlphabet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in self.elements.iter() {
            write_element(f, e, 1)?;
        }
        Ok(())
    }
}

/// A formula paired with a score, used both for peak decompositions and for
/// precursor candidates.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScoredMolecularFormula {
    pub formula: MolecularFormula,
    #[cfg_attr(feature = "serde", serde(default))]
    pub score: ScoreType,
}

impl ScoredMolecularFormula {
    pub fn new(formula: MolecularFormula, score: ScoreType) -> Self {
        Self { formula, score }
    }
}

impl From<MolecularFormula> for ScoredMolecularFormula {
    fn from(formula: MolecularFormula) -> Self {
        Self::new(formula, 0.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn f(s: &str) -> MolecularFormula {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let glucose = f("C6H12O6");
        assert_eq!(glucose.to_string(), "C6H12O6");
        assert_eq!(glucose.count_of("C"), 6);
        assert_eq!(glucose.count_of("N"), 0);
        assert!((glucose.mass() - 180.06338810).abs() < 1e-4, "{}", glucose.mass());

        let water = f("OH2");
        assert_eq!(water.to_string(), "H2O");
        assert_eq!(water, f("H2O"));

        let mixed = f("CH2CH2");
        assert_eq!(mixed, f("C2H4"));

        assert!(matches!(
            "C6h".parse::<MolecularFormula>(),
            Err(FormulaError::Malformed(_, 2))
        ));
        assert!(matches!(
            "Xx2".parse::<MolecularFormula>(),
            Err(FormulaError::UnknownElement(_))
        ));
    }

    #[test]
    fn test_subtraction() {
        let glucose = f("C6H12O6");
        let water = f("H2O");
        let loss = glucose.checked_sub(&water).unwrap();
        assert_eq!(loss, f("C6H10O5"));
        assert!((loss.mass() + water.mass() - glucose.mass()).abs() < 1e-6);

        assert!(water.checked_sub(&glucose).is_none());
        assert!(glucose.contains(&water));
        assert!(!water.contains(&glucose));
        assert!(!glucose.contains(&f("NH3")));
        assert!(glucose.checked_sub(&glucose).unwrap().is_empty());
        assert_eq!(loss.add(&water), glucose);
    }

    #[test]
    fn test_chemistry() {
        assert_eq!(f("C6H6").rdbe(), 4.0);
        assert_eq!(f("C6H12O6").rdbe(), 1.0);
        assert_eq!(f("C5H5N").rdbe(), 4.0);
        assert!(f("CH3").is_radical());
        assert!(!f("CH4").is_radical());
        assert_eq!(f("C6H12O6").hetero_atom_count(), 6);
    }

    #[test]
    fn test_alphabet() {
        let alphabet = ChemicalAlphabet::parse("CHNOPS").unwrap();
        assert_eq!(alphabet.len(), 6);
        assert_eq!(alphabet, ChemicalAlphabet::parse("SPONHC").unwrap());
        assert!(alphabet.admits(&f("C6H12O6")));
        assert!(!alphabet.admits(&f("C2H5Cl")));
        assert_eq!(f("C6H12O6").alphabet(), ChemicalAlphabet::parse("CHO").unwrap());
    }

    #[test]
    fn test_ordering() {
        assert_eq!(f("C6H12O6").cmp_atoms(&f("C6H12O6")), Ordering::Equal);
        assert_eq!(f("C6H12O6").cmp_atoms(&f("C7H16O5")), Ordering::Less);
        assert_eq!(f("C2H6").cmp_atoms(&f("C2H4")), Ordering::Greater);
        assert_eq!(f("CH4").cmp_atoms(&f("CH4O")), Ordering::Less);
        assert_eq!(f("CH4N").cmp_atoms(&f("CH4O")), Ordering::Less);
        // CO and N2 differ in mass before their atoms are compared
        assert_eq!(f("N2").cmp(&f("CO")), Ordering::Greater);
        let mut formulas = vec![f("C6H12O6"), f("H2O"), f("CH4"), f("H2O")];
        formulas.sort();
        assert_eq!(formulas, vec![f("CH4"), f("H2O"), f("H2O"), f("C6H12O6")]);
    }
}
