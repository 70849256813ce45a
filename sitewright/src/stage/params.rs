//! Compiled stage parameters.

use crate::errors::ConfigError;

/// Name/value parameters handed to a stage factory.
///
/// Values are fully resolved: `${property}` references were interpolated
/// while the manifest compiled. Order is preserved and the first declaration
/// of a name wins.
#[derive(Debug, Clone, Default)]
pub struct StageParams {
    values: Vec<(String, String)>,
}

impl StageParams {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from pairs.
    #[must_use]
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self { values: pairs }
    }

    /// Appends a parameter.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.push((name.into(), value.into()));
    }

    /// Looks a parameter up.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Looks a parameter up, failing with the stage's display name when it
    /// is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingParam`].
    pub fn require(&self, stage: &str, name: &str) -> Result<&str, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::MissingParam {
            stage: stage.to_string(),
            param: name.to_string(),
        })
    }

    /// A boolean parameter; absent means `default`.
    ///
    /// Accepts `true`/`false`, `yes`/`no`, and `1`/`0`.
    #[must_use]
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some("true" | "yes" | "1") => true,
            Some("false" | "no" | "0") => false,
            _ => default,
        }
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_declaration_wins() {
        let mut params = StageParams::new();
        params.insert("name", "first");
        params.insert("name", "second");
        assert_eq!(params.get("name"), Some("first"));
    }

    #[test]
    fn test_require_names_the_stage() {
        let params = StageParams::new();
        let err = params.require("/index.html/format:xml", "style").unwrap_err();
        assert!(err.to_string().contains("/index.html/format:xml"));
        assert!(err.to_string().contains("style"));
    }

    #[test]
    fn test_get_bool_spellings() {
        let mut params = StageParams::new();
        params.insert("a", "true");
        params.insert("b", "no");
        params.insert("c", "1");
        assert!(params.get_bool("a", false));
        assert!(!params.get_bool("b", true));
        assert!(params.get_bool("c", false));
        assert!(params.get_bool("missing", true));
        assert!(!params.get_bool("missing", false));
    }
}
