//! Input normalization for keyword matching

/// Lower-cased user input.
///
/// Word boundaries are not tracked: a keyword matches anywhere inside the
/// text, so "connect" also matches "reconnecting".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedText(String);

impl NormalizedText {
    pub fn new(input: &str) -> Self {
        Self(input.to_lowercase())
    }

    /// Keywords are expected to be lower-cased already
    pub fn contains(&self, keyword: &str) -> bool {
        self.0.contains(keyword)
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
