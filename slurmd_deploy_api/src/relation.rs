// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

/// Unordered pair of services that must be integrated.
///
/// The two endpoints are kept sorted so that `(a, b)` and `(b, a)` compare
/// and hash the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationEdge {
    first: String,
    second: String,
}

impl RelationEdge {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                first: a.to_string(),
                second: b.to_string(),
            }
        } else {
            Self {
                first: b.to_string(),
                second: a.to_string(),
            }
        }
    }

    pub fn endpoints(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }

    pub fn involves(&self, service: &str) -> bool {
        self.first == service || self.second == service
    }

    /// Return the endpoint other than `service`, if `service` is one of them.
    pub fn peer_of(&self, service: &str) -> Option<&str> {
        if self.first == service {
            Some(&self.second)
        } else if self.second == service {
            Some(&self.first)
        } else {
            None
        }
    }
}

impl std::fmt::Display for RelationEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} <-> {}", self.first, self.second)
    }
}

/// Relation requested by the configuration, with the targets that must be
/// converged before the relation may be added.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlannedRelation {
    pub a: String,
    pub b: String,
    #[serde(default)]
    pub after: Vec<crate::status::ConvergenceTarget>,
}

impl PlannedRelation {
    pub fn new(a: &str, b: &str) -> Self {
        Self {
            a: a.to_string(),
            b: b.to_string(),
            after: vec![],
        }
    }

    pub fn with_after(mut self, target: crate::status::ConvergenceTarget) -> Self {
        self.after.push(target);
        self
    }

    pub fn edge(&self) -> RelationEdge {
        RelationEdge::new(&self.a, &self.b)
    }
}
