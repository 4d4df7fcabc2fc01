//! HTTP header fields
//!
//! Header fields are kept in arrival order. Lookups are case-insensitive;
//! names are lowercased when the fields are handed to the HPACK encoder, as
//! HTTP/2 requires.

use super::MAX_HEADERS;
use std::fmt;

/// Ordered collection of header fields
///
/// Supports:
/// - Case-insensitive header name lookups
/// - Multiple values for the same header name
/// - Iteration in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty collection
    pub fn new() -> Self {
        Headers { fields: Vec::new() }
    }

    /// Append a field
    ///
    /// An existing field with the same name is kept; this adds another value.
    /// Returns false once the collection holds `MAX_HEADERS` fields, in which
    /// case the field is dropped.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        if self.fields.len() >= MAX_HEADERS {
            return false;
        }
        self.fields.push((name.into(), value.into()));
        true
    }

    /// Replace every value of `name` with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.insert(name, value);
    }

    /// Get the first value for a field (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a field (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a field exists
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all values of a field, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over all fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Fields in wire form: lowercase names, connection-specific fields
    /// dropped (RFC 7540 Section 8.1.2.2)
    pub(crate) fn wire_fields(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.fields
            .iter()
            .filter(|(n, _)| !is_connection_specific(n))
            .map(|(n, v)| (n.to_ascii_lowercase(), v.clone()))
    }
}

fn is_connection_specific(name: &str) -> bool {
    ["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}
