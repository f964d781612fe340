//! Task references: path-like pointers into a workflow's task graph.
//!
//! A reference such as `/do/0/order/try/1/charge` names one node of the
//! definition tree. Every step is `<scope>/<index>/<name>` where the scope is
//! the key under which the owning task keeps its children:
//!
//! | scope      | owner kind        |
//! |------------|-------------------|
//! | `do`       | root, Do, For     |
//! | `try`      | Try body          |
//! | `catch/do` | Try recovery body |
//! | `fork/branches` | Fork         |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ReferenceError;

/// The child list a reference step walks into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Do,
    Try,
    Catch,
    Branches,
}

impl ScopeKind {
    /// Path fragment used when rendering a reference.
    pub fn path(self) -> &'static str {
        match self {
            ScopeKind::Do => "do",
            ScopeKind::Try => "try",
            ScopeKind::Catch => "catch/do",
            ScopeKind::Branches => "fork/branches",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// One `<scope>/<index>/<name>` hop of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceStep {
    pub scope: ScopeKind,
    pub index: usize,
    pub name: String,
}

/// Pointer to a task node in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskReference(String);

impl TaskReference {
    /// Reference of the `index`-th top-level task.
    pub fn root(index: usize, name: &str) -> Self {
        Self(format!("/do/{index}/{name}"))
    }

    /// Reference of a child of this task within `scope`.
    pub fn child(&self, scope: ScopeKind, index: usize, name: &str) -> Self {
        Self(format!("{}/{}/{index}/{name}", self.0, scope.path()))
    }

    /// Parse and validate a rendered reference.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        parse_steps(raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The task name (last path segment).
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Decompose into scope hops, outermost first.
    pub fn steps(&self) -> Vec<ReferenceStep> {
        // Every constructor validates, so parsing cannot fail here.
        parse_steps(&self.0).unwrap_or_default()
    }

    /// Reference of the task owning this task's scope, or `None` at the root.
    pub fn owner(&self) -> Option<TaskReference> {
        let steps = self.steps();
        if steps.len() <= 1 {
            return None;
        }
        Some(Self::from_steps(&steps[..steps.len() - 1]))
    }

    /// The scope this task lives in and its index within that scope.
    pub fn position(&self) -> (ScopeKind, usize) {
        self.steps()
            .last()
            .map(|s| (s.scope, s.index))
            .unwrap_or((ScopeKind::Do, 0))
    }

    /// Depth in the task tree (top-level tasks have depth 1).
    pub fn depth(&self) -> usize {
        self.steps().len()
    }

    /// True if `self` is `other` or lies inside one of its scopes.
    pub fn is_within(&self, other: &TaskReference) -> bool {
        self.0 == other.0 || self.0.starts_with(&format!("{}/", other.0))
    }

    fn from_steps(steps: &[ReferenceStep]) -> Self {
        let mut out = String::new();
        for step in steps {
            out.push('/');
            out.push_str(step.scope.path());
            out.push_str(&format!("/{}/{}", step.index, step.name));
        }
        Self(out)
    }
}

fn parse_steps(raw: &str) -> Result<Vec<ReferenceStep>, ReferenceError> {
    let invalid = || ReferenceError::Invalid(raw.to_string());
    let mut tokens = raw.strip_prefix('/').ok_or_else(invalid)?.split('/');
    let mut steps = Vec::new();

    while let Some(token) = tokens.next() {
        let scope = match token {
            "do" => ScopeKind::Do,
            "try" => ScopeKind::Try,
            "catch" if tokens.next() == Some("do") => ScopeKind::Catch,
            "fork" if tokens.next() == Some("branches") => ScopeKind::Branches,
            _ => return Err(invalid()),
        };
        if steps.is_empty() && scope != ScopeKind::Do {
            return Err(invalid());
        }
        let index = tokens
            .next()
            .and_then(|t| t.parse::<usize>().ok())
            .ok_or_else(invalid)?;
        let name = tokens.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
        steps.push(ReferenceStep {
            scope,
            index,
            name: name.to_string(),
        });
    }

    if steps.is_empty() {
        return Err(invalid());
    }
    Ok(steps)
}

impl fmt::Display for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaskReference {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_steps(&value)?;
        Ok(Self(value))
    }
}

impl From<TaskReference> for String {
    fn from(value: TaskReference) -> Self {
        value.0
    }
}
