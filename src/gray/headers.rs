//! Ordered header multi-map and header mutations.
//!
//! The engine never touches host header types directly. It reads request
//! signals from a [`HeaderBag`] and emits [`HeaderMutation`]s, which the host
//! applies through [`HeaderSink`].

use crate::error::HeaderError;

/// Ordered mapping from lowercase header name to its values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBag {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// First value for `name`, or `""` when absent.
    pub fn get_or_default(&self, name: &str) -> &str {
        self.position(name)
            .and_then(|i| self.entries[i].1.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.position(name)
            .map(|i| self.entries[i].1.as_slice())
            .unwrap_or(&[])
    }

    /// All values for `name` joined by `sep`.
    ///
    /// HTTP/2 clients may split `cookie` across several header lines.
    pub fn joined(&self, name: &str, sep: &str) -> String {
        self.get_all(name).join(sep)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replaces every value of `name` with `value`, inserting it if absent.
    pub fn set_or_insert(&mut self, name: &str, value: impl Into<String>) {
        match self.position(name) {
            Some(i) => self.entries[i].1 = vec![value.into()],
            None => self
                .entries
                .push((name.to_ascii_lowercase(), vec![value.into()])),
        }
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        match self.position(name) {
            Some(i) => self.entries[i].1.push(value.into()),
            None => self
                .entries
                .push((name.to_ascii_lowercase(), vec![value.into()])),
        }
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(i) = self.position(name) {
            self.entries.remove(i);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = HeaderBag::new();
        for (name, value) in iter {
            bag.append(name.as_ref(), value);
        }
        bag
    }
}

/// A change to request or response headers.
///
/// Pseudo-headers `:path` and `:status` address the request target and the
/// response status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderMutation {
    Set(String, String),
    Append(String, String),
    Remove(String),
}

impl HeaderMutation {
    pub fn set(name: &str, value: impl Into<String>) -> Self {
        Self::Set(name.to_string(), value.into())
    }

    pub fn append(name: &str, value: impl Into<String>) -> Self {
        Self::Append(name.to_string(), value.into())
    }

    pub fn remove(name: &str) -> Self {
        Self::Remove(name.to_string())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Set(name, _) | Self::Append(name, _) | Self::Remove(name) => name,
        }
    }
}

/// Destination for header mutations.
pub trait HeaderSink {
    fn set_header(&mut self, name: &str, value: &str) -> Result<(), HeaderError>;
    fn append_header(&mut self, name: &str, value: &str) -> Result<(), HeaderError>;
    fn remove_header(&mut self, name: &str);
}

impl HeaderSink for HeaderBag {
    fn set_header(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        self.set_or_insert(name, value);
        Ok(())
    }

    fn append_header(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        self.append(name, value);
        Ok(())
    }

    fn remove_header(&mut self, name: &str) {
        self.remove(name);
    }
}

/// Applies mutations in order, collecting the ones the sink refused.
pub fn apply_mutations<S: HeaderSink + ?Sized>(
    sink: &mut S,
    mutations: &[HeaderMutation],
) -> Vec<HeaderError> {
    let mut rejected = Vec::new();
    for mutation in mutations {
        let result = match mutation {
            HeaderMutation::Set(name, value) => sink.set_header(name, value),
            HeaderMutation::Append(name, value) => sink.append_header(name, value),
            HeaderMutation::Remove(name) => {
                sink.remove_header(name);
                Ok(())
            }
        };
        if let Err(e) = result {
            rejected.push(e);
        }
    }
    rejected
}
