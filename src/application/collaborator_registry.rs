//! Task type to collaborator routing.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Task, TaskOutcome, TaskType};
use crate::domain::ports::Collaborator;

/// Maps each task type to the collaborator that runs it.
#[derive(Clone, Default)]
pub struct CollaboratorRegistry {
    collaborators: BTreeMap<TaskType, Arc<dyn Collaborator>>,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, task_type: TaskType, collaborator: Arc<dyn Collaborator>) -> Self {
        self.register(task_type, collaborator);
        self
    }

    /// Register `collaborator` for `task_type`, replacing any previous one.
    pub fn register(&mut self, task_type: TaskType, collaborator: Arc<dyn Collaborator>) {
        self.collaborators.insert(task_type, collaborator);
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn Collaborator>> {
        self.collaborators.get(&task_type)
    }

    /// Task types with a registered collaborator.
    pub fn task_types(&self) -> Vec<TaskType> {
        self.collaborators.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }

    /// Run `task` on its collaborator.
    ///
    /// A missing collaborator or an outcome of the wrong type is a
    /// non-retryable failure.
    pub async fn execute(&self, task: &Task) -> DomainResult<TaskOutcome> {
        let task_type = task.task_type();
        let collaborator = self.get(task_type).ok_or_else(|| {
            DomainError::collaborator_fatal(task_type, "no collaborator registered")
        })?;

        let outcome = collaborator.execute(task).await?;
        if outcome.task_type() != task_type {
            return Err(DomainError::collaborator_fatal(
                task_type,
                format!(
                    "{} returned a {} outcome",
                    collaborator.name(),
                    outcome.task_type()
                ),
            ));
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for CollaboratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.collaborators
                    .iter()
                    .map(|(t, c)| (t.as_str(), c.name())),
            )
            .finish()
    }
}
