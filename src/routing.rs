//! Topic router: resolves an inbound topic to its mapping
//!
//! Patterns use `/`-separated levels. `+` matches exactly one level, `#`
//! matches any remaining levels (including none) and must be last. A bare
//! `*` is accepted as an alias for `#`.
//!
//! Exact patterns always win. Among wildcard patterns the first one in
//! configuration order that matches is used.

use crate::config::TopicMapping;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("topic pattern is empty")]
    Empty,
    #[error("'#' must be the last level in '{0}'")]
    MisplacedMultiLevel(String),
    #[error("wildcard must occupy a whole level in '{0}'")]
    PartialWildcard(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Exact(String),
    Single,
    Rest,
}

/// A parsed topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let level = match *part {
                "#" | "*" => {
                    if i + 1 != parts.len() {
                        return Err(PatternError::MisplacedMultiLevel(pattern.to_string()));
                    }
                    Level::Rest
                }
                "+" => Level::Single,
                p if p.contains(['#', '+', '*']) => {
                    return Err(PatternError::PartialWildcard(pattern.to_string()))
                }
                p => Level::Exact(p.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            source: pattern.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_exact(&self) -> bool {
        self.levels.iter().all(|l| matches!(l, Level::Exact(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Rest => return true,
                Level::Single => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Level::Exact(want) => match parts.next() {
                    Some(got) if got == want => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Resolves topics against the configured mappings.
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    exact: HashMap<String, Arc<TopicMapping>>,
    wildcards: Vec<(TopicPattern, Arc<TopicMapping>)>,
}

impl TopicRouter {
    /// Build a router. The first mapping for a given exact topic wins.
    pub fn new(mappings: &[TopicMapping]) -> Result<Self, PatternError> {
        let mut router = Self::default();
        for mapping in mappings {
            let pattern = TopicPattern::parse(&mapping.topic)?;
            let mapping = Arc::new(mapping.clone());
            if pattern.is_exact() {
                router.exact.entry(mapping.topic.clone()).or_insert(mapping);
            } else {
                router.wildcards.push((pattern, mapping));
            }
        }
        Ok(router)
    }

    pub fn resolve(&self, topic: &str) -> Option<Arc<TopicMapping>> {
        if let Some(mapping) = self.exact.get(topic) {
            return Some(mapping.clone());
        }
        self.wildcards
            .iter()
            .find(|(pattern, _)| pattern.matches(topic))
            .map(|(_, mapping)| mapping.clone())
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
