//! Node filter expressions.
//!
//! A filter is a comma-separated list of terms; a node is selected when any
//! term matches it. Supported terms:
//!
//! - `_all` or `*`: every node
//! - `_local`: the local node
//! - `_id:<pattern>` / `_name:<pattern>`: node id or name
//! - `<attribute>:<pattern>`: a node attribute
//! - `<pattern>`: node id or name
//!
//! Patterns may contain `*` wildcards. An empty filter selects nothing.

use regex::Regex;
use std::fmt;
use thiserror::Error;

use super::node::NodeDescriptor;
use crate::core::types::NodeId;

/// Errors that can occur when parsing a node filter.
#[derive(Debug, Error)]
pub enum NodeFilterError {
    /// A term has an empty attribute name or value.
    #[error("invalid node filter term: '{0}'")]
    InvalidTerm(String),

    /// A wildcard pattern could not be compiled.
    #[error("invalid node filter pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    regex: Option<Regex>,
}

impl Pattern {
    fn parse(raw: &str) -> Result<Self, NodeFilterError> {
        let regex = if raw.contains('*') {
            let body = raw
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let compiled = Regex::new(&format!("^{}$", body)).map_err(|e| {
                NodeFilterError::InvalidPattern {
                    pattern: raw.to_string(),
                    reason: e.to_string(),
                }
            })?;
            Some(compiled)
        } else {
            None
        };
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    fn matches(&self, value: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(value),
            None => self.raw == value,
        }
    }
}

#[derive(Debug, Clone)]
enum Term {
    All,
    Local,
    Id(Pattern),
    Name(Pattern),
    Attribute { name: String, value: Pattern },
    IdOrName(Pattern),
}

impl Term {
    fn parse(raw: &str) -> Result<Self, NodeFilterError> {
        match raw {
            "_all" | "*" => return Ok(Term::All),
            "_local" => return Ok(Term::Local),
            _ => {}
        }

        match raw.split_once(':') {
            Some((name, value)) => {
                let (name, value) = (name.trim(), value.trim());
                if name.is_empty() || value.is_empty() {
                    return Err(NodeFilterError::InvalidTerm(raw.to_string()));
                }
                let pattern = Pattern::parse(value)?;
                Ok(match name {
                    "_id" => Term::Id(pattern),
                    "_name" => Term::Name(pattern),
                    _ => Term::Attribute {
                        name: name.to_string(),
                        value: pattern,
                    },
                })
            }
            None => Ok(Term::IdOrName(Pattern::parse(raw)?)),
        }
    }

    fn matches(&self, node: &NodeDescriptor, local: &NodeId) -> bool {
        match self {
            Term::All => true,
            Term::Local => &node.id == local,
            Term::Id(p) => p.matches(node.id.as_str()),
            Term::Name(p) => p.matches(&node.name),
            Term::Attribute { name, value } => node
                .attribute(name)
                .is_some_and(|actual| value.matches(actual)),
            Term::IdOrName(p) => p.matches(node.id.as_str()) || p.matches(&node.name),
        }
    }
}

/// A parsed node filter.
#[derive(Debug, Clone)]
pub struct NodeFilter {
    expression: String,
    terms: Vec<Term>,
}

impl NodeFilter {
    /// Parse a filter expression.
    pub fn parse(expression: &str) -> Result<Self, NodeFilterError> {
        let terms = expression
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Term::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            expression: expression.to_string(),
            terms,
        })
    }

    /// A filter selecting every node.
    pub fn all() -> Self {
        Self {
            expression: "_all".to_string(),
            terms: vec![Term::All],
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the filter can never select a node.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Whether `node` is selected, given the id of the local node.
    pub fn matches(&self, node: &NodeDescriptor, local: &NodeId) -> bool {
        self.terms.iter().any(|t| t.matches(node, local))
    }

    /// The selected subset of `nodes`, in input order.
    pub fn select(&self, nodes: &[NodeDescriptor], local: &NodeId) -> Vec<NodeDescriptor> {
        nodes
            .iter()
            .filter(|n| self.matches(n, local))
            .cloned()
            .collect()
    }
}

impl fmt::Display for NodeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}
