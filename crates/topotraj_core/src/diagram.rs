//! Persistence diagrams, their composite keys, and the read-only collection
//! that feeds every pipeline stage.

use crate::error::{TopoError, TopoResult};
use crate::traits::DiagramFilter;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single (birth, death) feature of homology dimension `dimension`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistencePair {
    pub birth: f64,
    pub death: f64,
    #[serde(default)]
    pub dimension: u32,
}

impl PersistencePair {
    pub fn new(birth: f64, death: f64, dimension: u32) -> Self {
        Self {
            birth,
            death,
            dimension,
        }
    }

    pub fn persistence(&self) -> f64 {
        self.death - self.birth
    }
}

/// Ordered sequence of persistence pairs. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistenceDiagram {
    pairs: Vec<PersistencePair>,
}

impl PersistenceDiagram {
    pub fn new(pairs: Vec<PersistencePair>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[PersistencePair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn dimensions(&self) -> BTreeSet<u32> {
        self.pairs.iter().map(|pair| pair.dimension).collect()
    }

    pub fn pairs_in_dimension(&self, dimension: u32) -> impl Iterator<Item = &PersistencePair> {
        self.pairs
            .iter()
            .filter(move |pair| pair.dimension == dimension)
    }

    /// Checks every pair for finite values and `death >= birth`.
    /// `label` names the diagram in the error.
    pub fn validate(&self, label: &str) -> TopoResult<()> {
        for (index, pair) in self.pairs.iter().enumerate() {
            if !pair.birth.is_finite() || !pair.death.is_finite() || pair.death < pair.birth {
                return Err(TopoError::DegenerateDiagram {
                    key: label.to_string(),
                    index,
                    birth: pair.birth,
                    death: pair.death,
                });
            }
        }
        Ok(())
    }

    /// Keeps the `k` most persistent pairs, most persistent first.
    /// Equal persistence keeps the original order.
    pub fn truncated(&self, k: usize) -> PersistenceDiagram {
        let mut pairs = self.pairs.clone();
        pairs.sort_by(|a, b| {
            b.persistence()
                .partial_cmp(&a.persistence())
                .unwrap_or(Ordering::Equal)
        });
        pairs.truncate(k);
        PersistenceDiagram { pairs }
    }
}

impl From<Vec<(f64, f64, u32)>> for PersistenceDiagram {
    fn from(triples: Vec<(f64, f64, u32)>) -> Self {
        PersistenceDiagram::new(
            triples
                .into_iter()
                .map(|(birth, death, dimension)| PersistencePair::new(birth, death, dimension))
                .collect(),
        )
    }
}

/// Typed value of a single key field.
///
/// Reals compare by `total_cmp` so keys can be hashed and ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl KeyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KeyValue::Integer(value) => Some(*value as f64),
            KeyValue::Real(value) => Some(*value),
            KeyValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KeyValue::Integer(value) => Some(*value),
            KeyValue::Real(value) if value.fract() == 0.0 && value.is_finite() => {
                Some(*value as i64)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyValue::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Loose comparison used by filters: numbers match across
    /// integer/real representations.
    pub fn matches(&self, other: &KeyValue) -> bool {
        match (self, other) {
            (KeyValue::Text(a), KeyValue::Text(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            KeyValue::Integer(_) => 0,
            KeyValue::Real(_) => 1,
            KeyValue::Text(_) => 2,
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Integer(a), KeyValue::Integer(b)) => a.cmp(b),
            (KeyValue::Real(a), KeyValue::Real(b)) => a.total_cmp(b),
            (KeyValue::Text(a), KeyValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            KeyValue::Integer(value) => value.hash(state),
            KeyValue::Real(value) => value.to_bits().hash(state),
            KeyValue::Text(value) => value.hash(state),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Integer(value) => write!(f, "{value}"),
            KeyValue::Real(value) => write!(f, "{value}"),
            KeyValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Integer(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Integer(value as i64)
    }
}

impl From<f64> for KeyValue {
    fn from(value: f64) -> Self {
        KeyValue::Real(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Text(value)
    }
}

/// Composite identifier of one diagram: named, typed fields such as case
/// name, scalar field and time step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagramKey {
    fields: BTreeMap<String, KeyValue>,
}

impl DiagramKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<KeyValue>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&KeyValue> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sub-key restricted to `fields`. Fields the key lacks are skipped.
    pub fn project<S: AsRef<str>>(&self, fields: &[S]) -> DiagramKey {
        let mut projected = DiagramKey::new();
        for field in fields {
            if let Some(value) = self.fields.get(field.as_ref()) {
                projected
                    .fields
                    .insert(field.as_ref().to_string(), value.clone());
            }
        }
        projected
    }

    /// Joins the listed field values with `separator`; missing fields
    /// contribute an empty segment.
    pub fn label<S: AsRef<str>>(&self, fields: &[S], separator: &str) -> String {
        fields
            .iter()
            .map(|field| {
                self.fields
                    .get(field.as_ref())
                    .map(ToString::to_string)
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Adds a text field `name` built by [`DiagramKey::label`].
    pub fn with_composite<S: AsRef<str>>(
        self,
        name: impl Into<String>,
        fields: &[S],
        separator: &str,
    ) -> Self {
        let label = self.label(fields, separator);
        self.with(name, label)
    }
}

impl fmt::Display for DiagramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.fields {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramEntry {
    pub key: DiagramKey,
    pub diagram: PersistenceDiagram,
}

/// Read-only set of keyed diagrams. Keys are unique and every diagram
/// passed validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<DiagramEntry>", into = "Vec<DiagramEntry>")]
pub struct DiagramCollection {
    entries: Vec<DiagramEntry>,
}

impl DiagramCollection {
    pub fn new(entries: Vec<DiagramEntry>) -> TopoResult<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(&entry.key) {
                return Err(TopoError::DuplicateKey(entry.key.to_string()));
            }
            entry.diagram.validate(&entry.key.to_string())?;
        }
        Ok(Self { entries })
    }

    pub fn from_pairs<I>(items: I) -> TopoResult<Self>
    where
        I: IntoIterator<Item = (DiagramKey, PersistenceDiagram)>,
    {
        Self::new(
            items
                .into_iter()
                .map(|(key, diagram)| DiagramEntry { key, diagram })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DiagramEntry] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &DiagramKey> {
        self.entries.iter().map(|entry| &entry.key)
    }

    pub fn get(&self, key: &DiagramKey) -> Option<&PersistenceDiagram> {
        self.entries
            .iter()
            .find(|entry| &entry.key == key)
            .map(|entry| &entry.diagram)
    }

    /// Entries accepted by `filter`, in collection order.
    pub fn subset<F: DiagramFilter + ?Sized>(&self, filter: &F) -> DiagramCollection {
        DiagramCollection {
            entries: self
                .entries
                .iter()
                .filter(|entry| filter.accepts(&entry.key))
                .cloned()
                .collect(),
        }
    }

    pub fn truncated(&self, k: usize) -> DiagramCollection {
        DiagramCollection {
            entries: self
                .entries
                .iter()
                .map(|entry| DiagramEntry {
                    key: entry.key.clone(),
                    diagram: entry.diagram.truncated(k),
                })
                .collect(),
        }
    }
}

impl TryFrom<Vec<DiagramEntry>> for DiagramCollection {
    type Error = TopoError;

    fn try_from(entries: Vec<DiagramEntry>) -> Result<Self, Self::Error> {
        DiagramCollection::new(entries)
    }
}

impl From<DiagramCollection> for Vec<DiagramEntry> {
    fn from(collection: DiagramCollection) -> Self {
        collection.entries
    }
}

/// Relational-style predicate over key fields, the equivalent of a
/// `WHERE` clause on the diagram index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldFilter {
    Equals { field: String, value: KeyValue },
    NotEquals { field: String, value: KeyValue },
    /// Inclusive on both ends; a missing bound is unbounded.
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    GreaterThan { field: String, value: f64 },
    LessThan { field: String, value: f64 },
    Modulo { field: String, divisor: i64, remainder: i64 },
    All { filters: Vec<FieldFilter> },
    Any { filters: Vec<FieldFilter> },
}

impl FieldFilter {
    pub fn equals(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        FieldFilter::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn not_equals(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        FieldFilter::NotEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn range(field: impl Into<String>, min: f64, max: f64) -> Self {
        FieldFilter::Range {
            field: field.into(),
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn greater_than(field: impl Into<String>, value: f64) -> Self {
        FieldFilter::GreaterThan {
            field: field.into(),
            value,
        }
    }

    pub fn less_than(field: impl Into<String>, value: f64) -> Self {
        FieldFilter::LessThan {
            field: field.into(),
            value,
        }
    }

    pub fn modulo(field: impl Into<String>, divisor: i64, remainder: i64) -> Self {
        FieldFilter::Modulo {
            field: field.into(),
            divisor,
            remainder,
        }
    }

    pub fn and(self, other: FieldFilter) -> Self {
        match self {
            FieldFilter::All { mut filters } => {
                filters.push(other);
                FieldFilter::All { filters }
            }
            first => FieldFilter::All {
                filters: vec![first, other],
            },
        }
    }

    pub fn or(self, other: FieldFilter) -> Self {
        match self {
            FieldFilter::Any { mut filters } => {
                filters.push(other);
                FieldFilter::Any { filters }
            }
            first => FieldFilter::Any {
                filters: vec![first, other],
            },
        }
    }

    fn numeric(key: &DiagramKey, field: &str) -> Option<f64> {
        key.get(field).and_then(KeyValue::as_f64)
    }
}

impl DiagramFilter for FieldFilter {
    fn accepts(&self, key: &DiagramKey) -> bool {
        match self {
            FieldFilter::Equals { field, value } => {
                key.get(field).is_some_and(|found| found.matches(value))
            }
            FieldFilter::NotEquals { field, value } => {
                key.get(field).is_some_and(|found| !found.matches(value))
            }
            FieldFilter::Range { field, min, max } => match Self::numeric(key, field) {
                Some(x) => min.map_or(true, |lo| x >= lo) && max.map_or(true, |hi| x <= hi),
                None => false,
            },
            FieldFilter::GreaterThan { field, value } => {
                Self::numeric(key, field).is_some_and(|x| x > *value)
            }
            FieldFilter::LessThan { field, value } => {
                Self::numeric(key, field).is_some_and(|x| x < *value)
            }
            FieldFilter::Modulo {
                field,
                divisor,
                remainder,
            } => {
                if *divisor == 0 {
                    return false;
                }
                key.get(field)
                    .and_then(KeyValue::as_i64)
                    .is_some_and(|x| x.rem_euclid(*divisor) == *remainder)
            }
            FieldFilter::All { filters } => filters.iter().all(|filter| filter.accepts(key)),
            FieldFilter::Any { filters } => filters.iter().any(|filter| filter.accepts(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(day: i64, it: &str) -> DiagramKey {
        DiagramKey::new().with("Day", day).with("It", it)
    }

    fn single_pair(death: f64) -> PersistenceDiagram {
        PersistenceDiagram::from(vec![(0.0, death, 0)])
    }

    #[test]
    fn truncated_keeps_most_persistent_pairs_in_order() {
        let diagram = PersistenceDiagram::from(vec![
            (0.0, 1.0, 0),
            (0.0, 5.0, 0),
            (2.0, 2.5, 1),
            (1.0, 4.0, 1),
        ]);
        let kept = diagram.truncated(2);
        let persistences: Vec<f64> = kept.pairs().iter().map(|p| p.persistence()).collect();
        assert_eq!(persistences, vec![5.0, 3.0]);
        assert_eq!(diagram.truncated(10).len(), 4);
    }

    #[test]
    fn validate_rejects_inverted_pair() {
        let diagram = PersistenceDiagram::from(vec![(0.0, 1.0, 0), (2.0, 1.0, 0)]);
        let err = diagram.validate("case").expect_err("expected degenerate diagram");
        match err {
            TopoError::DegenerateDiagram { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn collection_rejects_duplicate_keys() {
        let result = DiagramCollection::from_pairs(vec![
            (key(1, "It1"), single_pair(1.0)),
            (key(1, "It1"), single_pair(2.0)),
        ]);
        assert!(matches!(result, Err(TopoError::DuplicateKey(_))));
    }

    #[test]
    fn collection_rejects_degenerate_diagram() {
        let bad = PersistenceDiagram::from(vec![(3.0, 1.0, 0)]);
        let result = DiagramCollection::from_pairs(vec![(key(1, "It1"), bad)]);
        assert!(matches!(result, Err(TopoError::DegenerateDiagram { .. })));
    }

    #[test]
    fn key_values_compare_reals_by_bits() {
        let a = DiagramKey::new().with("t", 0.5);
        let b = DiagramKey::new().with("t", 0.5);
        let c = DiagramKey::new().with("t", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn project_and_label_build_join_columns() {
        let key = DiagramKey::new()
            .with("CaseName", "run")
            .with("ScalarField", "mag(B)")
            .with("TimeStep", 2460);
        let projected = key.project(&["TimeStep", "Missing"]);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("TimeStep"), Some(&KeyValue::Integer(2460)));

        let composite = key.with_composite("Case_Field", &["CaseName", "ScalarField"], "_");
        assert_eq!(
            composite.get("Case_Field").and_then(KeyValue::as_str),
            Some("run_mag(B)")
        );
    }

    #[test]
    fn field_filters_follow_where_clause_semantics() {
        let collection = DiagramCollection::from_pairs(
            (160..200)
                .step_by(5)
                .map(|day| (key(day, if day % 2 == 0 { "It2" } else { "It3" }), single_pair(1.0))),
        )
        .expect("collection");

        let window = FieldFilter::range("Day", 170.0, 190.0);
        let days: Vec<i64> = collection
            .subset(&window)
            .keys()
            .filter_map(|k| k.get("Day").and_then(KeyValue::as_i64))
            .collect();
        assert_eq!(days, vec![170, 175, 180, 185, 190]);

        let even_it2 = FieldFilter::equals("It", "It2").and(FieldFilter::modulo("Day", 10, 0));
        assert_eq!(collection.subset(&even_it2).len(), 4);

        let after = FieldFilter::greater_than("Day", 190.0).or(FieldFilter::less_than("Day", 161.0));
        assert_eq!(collection.subset(&after).len(), 2);

        let closure = |k: &DiagramKey| k.get("It").and_then(KeyValue::as_str) == Some("It3");
        assert_eq!(collection.subset(&closure).len(), 4);
    }

    #[test]
    fn numeric_equality_matches_across_representations() {
        let filter = FieldFilter::equals("Day", 170.0);
        assert!(filter.accepts(&key(170, "It1")));
        assert!(!FieldFilter::not_equals("Day", 170).accepts(&key(170, "It1")));
    }
}
