//! Flow directive resolution.
//!
//! Given the task that just finished and the directive it produced,
//! [`resolve_next`] computes where control goes next. Resolution is a pure
//! function of the definition, so resolving the same pair twice yields the
//! same answer.
//!
//! Scope boundaries:
//! - `do`, `try` and `catch` lists are transparent: exhausting or exiting
//!   one completes its owner, and resolution continues with the owner's own
//!   `then` directive.
//! - a `for` body ends the current iteration; the loop decides whether to
//!   run another one. `exit` inside the body breaks the loop.
//! - each fork branch is a boundary: finishing it reports to the fork.
//! - named directives never cross a `for`, fork or workflow boundary.

use conduit_types::reference::{ScopeKind, TaskReference};
use conduit_types::task::{FlowDirective, TaskDefinition, TaskKind, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowTarget {
    /// Start this task next.
    Task(TaskReference),
    /// The current iteration of this `for` task ended.
    IterationEnd(TaskReference),
    /// A branch of this fork task ended.
    BranchEnd(TaskReference),
    /// The top-level task list is finished.
    WorkflowEnd,
}

/// Where control goes after a task finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowResolution {
    /// Composite tasks that complete on the way out, innermost first.
    pub exited: Vec<TaskReference>,
    pub target: FlowTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("task reference '{0}' does not exist in the workflow definition")]
    UnknownReference(TaskReference),

    #[error("flow directive '{name}' from '{from}' does not name a reachable task")]
    UnresolvedDirective { name: String, from: TaskReference },
}

/// The kind of list a task lives in.
enum Scope {
    Root,
    /// `do`, `try` or `catch` list of `owner`.
    Sequence(TaskReference),
    /// Body of the `for` task `owner`.
    Loop(TaskReference),
    /// Branch list of the fork `owner`.
    Branches(TaskReference),
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the directive produced by `current`.
pub fn resolve_next(
    definition: &WorkflowDefinition,
    current: &TaskReference,
    directive: &FlowDirective,
) -> Result<FlowResolution, FlowError> {
    if definition.resolve(current).is_none() {
        return Err(FlowError::UnknownReference(current.clone()));
    }

    let mut exited = Vec::new();
    let mut cursor = current.clone();
    let mut directive = directive.clone();

    loop {
        let (scope, tasks) = scope_of(definition, &cursor)?;
        let (_, index) = cursor.position();

        match &directive {
            FlowDirective::Continue => {
                if !matches!(scope, Scope::Branches(_)) {
                    if let Some(next) = tasks.get(index + 1) {
                        let target = sibling(&cursor, index + 1, &next.name);
                        return Ok(FlowResolution {
                            exited,
                            target: FlowTarget::Task(target),
                        });
                    }
                }
                match scope {
                    Scope::Root => return Ok(finish(exited, FlowTarget::WorkflowEnd)),
                    Scope::Loop(owner) => {
                        return Ok(finish(exited, FlowTarget::IterationEnd(owner)));
                    }
                    Scope::Branches(owner) => {
                        return Ok(finish(exited, FlowTarget::BranchEnd(owner)));
                    }
                    Scope::Sequence(owner) => {
                        directive = owner_directive(definition, &owner)?;
                        exited.push(owner.clone());
                        cursor = owner;
                    }
                }
            }
            FlowDirective::Exit => match scope {
                Scope::Root => return Ok(finish(exited, FlowTarget::WorkflowEnd)),
                Scope::Branches(owner) => {
                    return Ok(finish(exited, FlowTarget::BranchEnd(owner)));
                }
                Scope::Sequence(owner) | Scope::Loop(owner) => {
                    directive = owner_directive(definition, &owner)?;
                    exited.push(owner.clone());
                    cursor = owner;
                }
            },
            FlowDirective::End => match scope {
                Scope::Root => return Ok(finish(exited, FlowTarget::WorkflowEnd)),
                Scope::Loop(owner) => {
                    return Ok(finish(exited, FlowTarget::IterationEnd(owner)));
                }
                Scope::Branches(owner) => {
                    return Ok(finish(exited, FlowTarget::BranchEnd(owner)));
                }
                Scope::Sequence(owner) => {
                    exited.push(owner.clone());
                    cursor = owner;
                }
            },
            FlowDirective::Goto(name) => {
                if !matches!(scope, Scope::Branches(_)) {
                    if let Some(position) = tasks.iter().position(|t| &t.name == name) {
                        let target = sibling(&cursor, position, name);
                        return Ok(FlowResolution {
                            exited,
                            target: FlowTarget::Task(target),
                        });
                    }
                }
                match scope {
                    Scope::Sequence(owner) => {
                        exited.push(owner.clone());
                        cursor = owner;
                    }
                    _ => {
                        return Err(FlowError::UnresolvedDirective {
                            name: name.clone(),
                            from: current.clone(),
                        });
                    }
                }
            }
        }
    }
}

fn finish(exited: Vec<TaskReference>, target: FlowTarget) -> FlowResolution {
    FlowResolution { exited, target }
}

/// Reference of the task at `index` in the same list as `cursor`.
fn sibling(cursor: &TaskReference, index: usize, name: &str) -> TaskReference {
    let (scope, _) = cursor.position();
    match cursor.owner() {
        None => TaskReference::root(index, name),
        Some(owner) => owner.child(scope, index, name),
    }
}

fn owner_directive(
    definition: &WorkflowDefinition,
    owner: &TaskReference,
) -> Result<FlowDirective, FlowError> {
    definition
        .resolve(owner)
        .map(TaskDefinition::directive)
        .ok_or_else(|| FlowError::UnknownReference(owner.clone()))
}

fn scope_of<'a>(
    definition: &'a WorkflowDefinition,
    reference: &TaskReference,
) -> Result<(Scope, &'a [TaskDefinition]), FlowError> {
    let unknown = || FlowError::UnknownReference(reference.clone());
    let (scope, _) = reference.position();

    let Some(owner) = reference.owner() else {
        return Ok((Scope::Root, definition.tasks.as_slice()));
    };
    let owner_def = definition.resolve(&owner).ok_or_else(unknown)?;
    let tasks = owner_def.children(scope).ok_or_else(unknown)?;
    let kind = match (scope, &owner_def.kind) {
        (ScopeKind::Branches, _) => Scope::Branches(owner),
        (ScopeKind::Do, TaskKind::For(_)) => Scope::Loop(owner),
        _ => Scope::Sequence(owner),
    };
    Ok((kind, tasks))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
