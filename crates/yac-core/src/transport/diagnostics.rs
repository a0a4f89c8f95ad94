//! Classification of non-protocol output.
//!
//! Backends print all sorts of things besides frames: dependency warnings,
//! tracebacks, progress noise. Lines that fail to decode (and all stderr lines)
//! go through a [`DiagnosticPolicy`]; matching lines become diagnostics, the
//! rest are dropped.

use regex::{Regex, RegexBuilder};

/// Markers recognised by the default policy.
pub const DEFAULT_MARKERS: &[&str] = &["error", "warn", "warning", "traceback", "exception"];

#[derive(Debug, Clone)]
pub struct DiagnosticPolicy {
    pattern: Option<Regex>,
}

impl DiagnosticPolicy {
    /// Case-insensitive match on any of the given markers.
    ///
    /// An empty marker list yields a silent policy.
    pub fn with_markers<S: AsRef<str>>(markers: &[S]) -> Result<Self, regex::Error> {
        let alternatives: Vec<String> = markers
            .iter()
            .map(|m| m.as_ref().trim())
            .filter(|m| !m.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Ok(Self::silent());
        }
        Self::from_pattern(&format!("(?:{})", alternatives.join("|")))
    }

    /// Use a custom regular expression, matched case-insensitively.
    pub fn from_pattern(pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self {
            pattern: Some(regex),
        })
    }

    /// Drop every undecodable line.
    pub fn silent() -> Self {
        Self { pattern: None }
    }

    pub fn is_silent(&self) -> bool {
        self.pattern.is_none()
    }

    /// Return the diagnostic text if `raw` should be surfaced.
    pub fn classify(&self, raw: &str) -> Option<String> {
        let pattern = self.pattern.as_ref()?;
        let text = raw.trim();
        if text.is_empty() || !pattern.is_match(text) {
            return None;
        }
        Some(text.to_string())
    }
}

impl Default for DiagnosticPolicy {
    fn default() -> Self {
        Self::with_markers(DEFAULT_MARKERS).unwrap_or_else(|_| Self::silent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_common_markers() {
        let policy = DiagnosticPolicy::default();
        assert_eq!(
            policy.classify("  Traceback (most recent call last):  "),
            Some("Traceback (most recent call last):".to_string())
        );
        assert!(policy.classify("ERROR: model not found").is_some());
        assert!(policy.classify("npm WARN deprecated glob@7").is_some());
        assert!(policy.classify("ValueError exception raised").is_some());
    }

    #[test]
    fn default_policy_drops_noise() {
        let policy = DiagnosticPolicy::default();
        assert_eq!(policy.classify("Downloading packages..."), None);
        assert_eq!(policy.classify(""), None);
        assert_eq!(policy.classify("   "), None);
    }

    #[test]
    fn custom_markers_are_escaped() {
        let policy = DiagnosticPolicy::with_markers(&["[fatal]"]).unwrap();
        assert!(policy.classify("[FATAL] out of memory").is_some());
        assert!(policy.classify("f").is_none());
        assert!(policy.classify("an error").is_none());
    }

    #[test]
    fn empty_markers_are_silent() {
        let policy = DiagnosticPolicy::with_markers::<&str>(&[]).unwrap();
        assert!(policy.is_silent());
        assert_eq!(policy.classify("error"), None);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(DiagnosticPolicy::from_pattern("(unclosed").is_err());
    }
}
