//! Topic patterns and wildcard matching
//!
//! Topics are `/`-separated hierarchies such as `machines/12/status`. A
//! subscription pattern may replace whole segments with `+` (exactly one
//! segment) or end with `#` (one or more trailing segments).

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SEPARATOR: char = '/';
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

const MAX_TOPIC_LEN: usize = 65535;

/// Topic and pattern validation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic exceeds 65535 bytes")]
    TooLong,
    #[error("topic cannot contain a null character")]
    NullCharacter,
    #[error("multi-level wildcard '#' must be the last segment")]
    MultiLevelNotLast,
    #[error("wildcard must occupy an entire segment, found '{0}'")]
    MixedWildcard(String),
    #[error("topic names used for publishing cannot contain wildcards")]
    WildcardInTopic,
}

/// One segment of a parsed pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `+`
    SingleLevel,
    /// `#`
    MultiLevel,
}

/// Validated subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        check_common(raw)?;

        let levels: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = levels.len() - 1;
        let mut segments = Vec::with_capacity(levels.len());

        for (index, level) in levels.iter().enumerate() {
            let segment = match *level {
                MULTI_LEVEL_WILDCARD if index == last => Segment::MultiLevel,
                MULTI_LEVEL_WILDCARD => return Err(TopicError::MultiLevelNotLast),
                SINGLE_LEVEL_WILDCARD => Segment::SingleLevel,
                literal if literal.contains(['+', '#']) => {
                    return Err(TopicError::MixedWildcard(literal.to_string()));
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True when the pattern contains `+` or `#`
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Check a concrete topic against this pattern
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split(SEPARATOR);

        for segment in &self.segments {
            match segment {
                // '#' stands for at least one remaining level
                Segment::MultiLevel => return levels.next().is_some(),
                Segment::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }

        levels.next().is_none()
    }
}

impl FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Match `topic` against an unparsed `pattern`.
///
/// Malformed patterns never match.
pub fn matches(topic: &str, pattern: &str) -> bool {
    TopicPattern::parse(pattern)
        .map(|p| p.matches(topic))
        .unwrap_or(false)
}

/// Validate a topic used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopic);
    }
    Ok(())
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    Ok(())
}
