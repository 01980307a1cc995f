//! Channel Name Matching
//!
//! Channel definitions are bound to either a named-parameter pattern like
//! `user/:id` or a regular expression. Patterns are matched segment by
//! segment; `:name` segments capture into the context params. Regular
//! expressions contribute their named capture groups.

use std::collections::HashMap;

use regex::Regex;

/// Matcher bound to a channel definition
pub enum ChannelMatcher {
    /// Named-parameter path pattern, e.g. `user/:id`
    Pattern(ChannelPattern),
    /// Regular expression; named captures become params
    Regex(Regex),
}

impl ChannelMatcher {
    /// Match a channel name, returning captured params on success
    pub fn matches(&self, channel: &str) -> Option<HashMap<String, String>> {
        match self {
            Self::Pattern(pattern) => pattern.matches(channel),
            Self::Regex(regex) => {
                let captures = regex.captures(channel)?;
                let mut params = HashMap::new();
                for name in regex.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        params.insert(name.to_string(), value.as_str().to_string());
                    }
                }
                Some(params)
            }
        }
    }
}

/// Parsed `user/:id`-style pattern
pub struct ChannelPattern {
    segments: Vec<Segment>,
}

enum Segment {
    Literal(String),
    Param(String),
}

impl ChannelPattern {
    /// Parse a pattern. Empty patterns and empty `:` params are rejected.
    pub fn parse(pattern: &str) -> Option<Self> {
        if pattern.is_empty() {
            return None;
        }
        let mut segments = Vec::new();
        for part in pattern.split('/') {
            if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return None;
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Some(Self { segments })
    }

    /// Match a channel name segment-wise
    pub fn matches(&self, channel: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = channel.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}
