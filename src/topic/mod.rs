//! Topic path handling
//!
//! A topic is split exactly once at the edge of the core into an ordered
//! sequence of levels; the rest of the broker operates on the parsed form.

pub mod validation;

pub use validation::{validate_topic_filter, validate_topic_name};

use compact_str::CompactString;
use smallvec::SmallVec;

/// A parsed topic name or topic filter.
///
/// Classifies dollar topics (`$SYS/...` and friends) so the tries can route
/// them to their isolated roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPath {
    levels: SmallVec<[CompactString; 8]>,
    dollar: bool,
}

impl TopicPath {
    /// Parse and validate a concrete topic name (no wildcards allowed).
    pub fn from_topic(topic: &str) -> Result<Self, &'static str> {
        validation::validate_topic_name(topic)?;
        Ok(Self::split(topic))
    }

    /// Parse and validate a topic filter (`+`/`#` wildcards allowed).
    pub fn from_filter(filter: &str) -> Result<Self, &'static str> {
        validation::validate_topic_filter(filter)?;
        Ok(Self::split(filter))
    }

    fn split(s: &str) -> Self {
        let levels: SmallVec<[CompactString; 8]> =
            s.split('/').map(CompactString::new).collect();
        let dollar = s.starts_with('$');
        Self { levels, dollar }
    }

    pub fn levels(&self) -> &[CompactString] {
        &self.levels
    }

    /// Whether the first level begins with `$`.
    pub fn is_dollar(&self) -> bool {
        self.dollar
    }
}
