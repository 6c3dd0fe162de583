//! Snippet inputs submitted by the documentation pipeline

use serde::{Deserialize, Serialize};

/// A unit of documentation-embedded source code submitted for execution
///
/// Immutable once submitted. Snippets that share a `context_group_id` form
/// an ordered sequence: their `sequence_index` values decide execution
/// order within the group. Snippets with non-deterministic output must be
/// marked non-cacheable by the caller rather than relying on the subsystem
/// to guess determinism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    /// Raw source text of the embedded code block
    pub source_text: String,
    /// Context group this snippet belongs to, if any
    pub context_group_id: Option<String>,
    /// Position within its context group
    pub sequence_index: u32,
    /// Whether the result may be served from the cache
    pub cacheable: bool,
}

impl Snippet {
    /// Create a standalone, cacheable snippet
    #[inline]
    #[must_use]
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            context_group_id: None,
            sequence_index: 0,
            cacheable: true,
        }
    }

    /// Attach the snippet to a context group at the given sequence position
    #[must_use]
    pub fn in_group(mut self, group_id: impl Into<String>, sequence_index: u32) -> Self {
        self.context_group_id = Some(group_id.into());
        self.sequence_index = sequence_index;
        self
    }

    /// Mark the snippet as non-cacheable (non-deterministic output)
    #[inline]
    #[must_use]
    pub fn non_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Canonical source form used for fingerprinting
    ///
    /// Normalizes CRLF line endings, strips trailing whitespace per line
    /// and guarantees a single trailing newline, so editor noise does not
    /// defeat the cache.
    #[must_use]
    pub fn normalized_source(&self) -> String {
        let mut out = String::with_capacity(self.source_text.len() + 1);
        for line in self.source_text.replace("\r\n", "\n").split('\n') {
            out.push_str(line.trim_end());
            out.push('\n');
        }
        // Collapse the trailing blank lines the split above produces
        while out.ends_with("\n\n") {
            out.pop();
        }
        out
    }
}
