//! Ordered string multimaps and query-string parsing.
//!
//! Headers and query parameters are multimaps that must preserve insertion
//! order (for serialization stability) while supporting lookups that are
//! either case-sensitive (query parameters) or case-insensitive (HTTP
//! header names). Values may be absent: `?a&b=1` has a valueless `a`.

use std::fmt;
use std::marker::PhantomData;

/// Name comparison policy for a [`StringMultiMap`]
pub trait NameMatch: Send + Sync + 'static {
    fn matches(a: &str, b: &str) -> bool;
}

/// Exact byte comparison of names
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseSensitive;

impl NameMatch for CaseSensitive {
    fn matches(a: &str, b: &str) -> bool {
        a == b
    }
}

/// ASCII case-folded comparison of names
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseInsensitive;

impl NameMatch for CaseInsensitive {
    fn matches(a: &str, b: &str) -> bool {
        a.eq_ignore_ascii_case(b)
    }
}

/// Insertion-ordered multimap from names to optional values
pub struct StringMultiMap<M: NameMatch> {
    entries: Vec<(String, Option<String>)>,
    _match: PhantomData<M>,
}

pub type StringMultiMapSensitive = StringMultiMap<CaseSensitive>;
pub type StringMultiMapInsensitive = StringMultiMap<CaseInsensitive>;

impl<M: NameMatch> StringMultiMap<M> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            _match: PhantomData,
        }
    }

    /// Append a value; existing values for the name are kept
    pub fn add(&mut self, name: impl Into<String>, value: Option<&str>) {
        self.entries
            .push((name.into(), value.map(|v| v.to_string())));
    }

    /// All values for `name`, in insertion order
    pub fn lookup(&self, name: &str) -> Vec<Option<&str>> {
        self.entries
            .iter()
            .filter(|(n, _)| M::matches(n, name))
            .map(|(_, v)| v.as_deref())
            .collect()
    }

    /// The value for `name` only when exactly one value is present
    pub fn lookup1(&self, name: &str) -> Option<&str> {
        let mut found = self.entries.iter().filter(|(n, _)| M::matches(n, name));
        match (found.next(), found.next()) {
            (Some((_, v)), None) => v.as_deref(),
            _ => None,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| M::matches(n, name))
    }

    /// Remove every value for `name`; true if anything was removed
    pub fn remove_all(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !M::matches(n, name));
        before != self.entries.len()
    }

    /// Remove every value for any of `names`; true if anything was removed
    pub fn remove_all_of(&mut self, names: &[&str]) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(n, _)| !names.iter().any(|name| M::matches(n, name)));
        before != self.entries.len()
    }

    /// Remove the (name, value) pairs that match exactly; values compare
    /// case-sensitively
    pub fn remove(&mut self, name: &str, value: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(n, v)| !(M::matches(n, name) && v.as_deref() == Some(value)));
        before != self.entries.len()
    }

    pub fn num_values(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(n, _)| n.as_str())
    }

    pub fn value(&self, index: usize) -> Option<&str> {
        self.entries.get(index).and_then(|(_, v)| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<M: NameMatch> Default for StringMultiMap<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: NameMatch> Clone for StringMultiMap<M> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            _match: PhantomData,
        }
    }
}

impl<M: NameMatch> PartialEq for StringMultiMap<M> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<M: NameMatch> fmt::Debug for StringMultiMap<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

// =============================================================================
// Query Parameters
// =============================================================================

/// Parsed query string; values are held escaped as they appeared
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    map: StringMultiMapSensitive,
}

impl QueryParams {
    /// Parse `a=1&b&c=%20` (no leading `?`). Empty segments are skipped.
    pub fn parse(query: &str) -> Self {
        let mut map = StringMultiMapSensitive::new();
        for segment in query.split('&').filter(|s| !s.is_empty()) {
            match segment.split_once('=') {
                Some((name, value)) => map.add(name, Some(value)),
                None => map.add(segment, None),
            }
        }
        Self { map }
    }

    pub fn add_escaped(&mut self, name: &str, escaped_value: Option<&str>) {
        self.map.add(name, escaped_value);
    }

    /// Escaped value when the parameter occurs exactly once
    pub fn lookup1_escaped(&self, name: &str) -> Option<&str> {
        self.map.lookup1(name)
    }

    /// Percent-decoded value when the parameter occurs exactly once.
    ///
    /// `+` decodes to a space as in form encoding.
    pub fn lookup1_unescaped(&self, name: &str) -> Option<String> {
        let escaped = self.map.lookup1(name)?;
        let plus_decoded = escaped.replace('+', " ");
        urlencoding::decode(&plus_decoded)
            .ok()
            .map(|decoded| decoded.into_owned())
    }

    pub fn lookup(&self, name: &str) -> Vec<Option<&str>> {
        self.map.lookup(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.has(name)
    }

    pub fn remove_all(&mut self, name: &str) -> bool {
        self.map.remove_all(name)
    }

    pub fn len(&self) -> usize {
        self.map.num_values()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Re-serialize in original order
    pub fn to_escaped_string(&self) -> String {
        self.map
            .iter()
            .map(|(name, value)| match value {
                Some(v) => format!("{}={}", name, v),
                None => name.to_string(),
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}
