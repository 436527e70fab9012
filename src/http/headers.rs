//! Ordered, case-insensitive header storage.

use std::fmt;

/// Header fields in arrival (or insertion) order.
///
/// Names compare case-insensitively and a name may repeat, so `Set-Cookie`
/// style multi-value headers survive unchanged.
///
/// ```
/// use switchyard::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Vary", "Origin");
/// headers.insert("vary", "Accept");
/// headers.set("Content-Type", "application/json");
///
/// assert_eq!(headers.get_all("VARY").count(), 2);
/// assert_eq!(headers.get("content-type"), Some("application/json"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Appends a field, keeping any existing values for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value for `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drops every value for `name`; `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut h = Headers::new();
        h.insert("Authorization", "Bearer abc");
        assert_eq!(h.get("authorization"), Some("Bearer abc"));
        assert!(h.contains("AUTHORIZATION"));
        assert!(!h.contains("x-missing"));
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        h.insert("content-type", "text/html");
        h.set("Content-Type", "application/json");
        let values: Vec<_> = h.get_all("content-type").collect();
        assert_eq!(values, vec!["application/json"]);
    }

    #[test]
    fn remove_reports_whether_anything_changed() {
        let mut h = Headers::new();
        h.insert("X-Trace", "1");
        assert!(h.remove("x-trace"));
        assert!(!h.remove("x-trace"));
        assert!(h.is_empty());
    }

    #[test]
    fn display_writes_wire_lines() {
        let mut h = Headers::new();
        h.insert("A", "1");
        h.insert("B", "2");
        assert_eq!(h.to_string(), "A: 1\r\nB: 2\r\n");
    }
}
