//! The uniform four-field result envelope returned by every operation.
//!
//! `output`, `error`, `system`, and `binary_image` are all optional text
//! fields, combined field-by-field when two envelopes need to be merged
//! (e.g. annotating an auto-restart onto the result of a re-run).

use serde::Serialize;

/// Result of a bash or file operation, serialized directly as the HTTP
/// response body for `/bash` and `/file`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ToolResult {
    pub output: Option<String>,
    pub error: Option<String>,
    pub system: Option<String>,
    #[serde(rename = "base64_image")]
    pub binary_image: Option<String>,
}

impl ToolResult {
    #[must_use]
    pub fn output(text: impl Into<String>) -> Self {
        Self {
            output: Some(text.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            error: Some(text.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            system: Some(text.into()),
            ..Default::default()
        }
    }

    /// True iff any field carries content.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        self.output.as_deref().is_some_and(|s| !s.is_empty())
            || self.error.as_deref().is_some_and(|s| !s.is_empty())
            || self.system.as_deref().is_some_and(|s| !s.is_empty())
            || self
                .binary_image
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }

    /// Combine two envelopes field-by-field. Text fields concatenate in
    /// order; `binary_image` cannot be combined from both sides.
    ///
    /// # Panics
    /// Panics if both `self` and `other` carry a `binary_image` — callers
    /// that might combine binary results should check `is_truthy` first.
    #[must_use]
    pub fn combine(self, other: ToolResult) -> ToolResult {
        ToolResult {
            output: concat_field(self.output, other.output),
            error: concat_field(self.error, other.error),
            system: concat_field(self.system, other.system),
            binary_image: match (self.binary_image, other.binary_image) {
                (Some(_), Some(_)) => panic!("cannot combine tool results: both carry a binary image"),
                (Some(a), None) => Some(a),
                (None, b) => b,
            },
        }
    }

    /// Returns a copy with `system` set, preserving any existing `system`
    /// text by prefixing the new message before it (used for auto-restart
    /// annotations and `Created new session` notes).
    #[must_use]
    pub fn with_system_prefix(mut self, prefix: &str) -> Self {
        self.system = Some(match self.system {
            Some(existing) if !existing.is_empty() => format!("{prefix} {existing}"),
            _ => prefix.to_string(),
        });
        self
    }
}

fn concat_field(a: Option<String>, b: Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + &b),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_concatenates_text_fields() {
        let a = ToolResult::output("foo");
        let b = ToolResult {
            output: Some("bar".into()),
            error: Some("e".into()),
            ..Default::default()
        };
        let combined = a.combine(b);
        assert_eq!(combined.output.as_deref(), Some("foobar"));
        assert_eq!(combined.error.as_deref(), Some("e"));
    }

    #[test]
    #[should_panic(expected = "cannot combine")]
    fn combine_rejects_two_binary_images() {
        let a = ToolResult {
            binary_image: Some("aaaa".into()),
            ..Default::default()
        };
        let b = ToolResult {
            binary_image: Some("bbbb".into()),
            ..Default::default()
        };
        let _ = a.combine(b);
    }

    #[test]
    fn empty_envelope_is_not_truthy() {
        assert!(!ToolResult::default().is_truthy());
        assert!(ToolResult::output("x").is_truthy());
    }

    #[test]
    fn with_system_prefix_preserves_existing_message() {
        let r = ToolResult::system("inner").with_system_prefix("outer.");
        assert_eq!(r.system.as_deref(), Some("outer. inner"));
    }
}
