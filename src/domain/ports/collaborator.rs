use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskOutcome};
use async_trait::async_trait;

/// Port for the external agents that do the actual content work.
///
/// A collaborator receives the task (its payload is the typed input) and
/// returns a typed outcome, or a `DomainError::CollaboratorError`. Calls may
/// be long (LLM round trips) and are cancelled by dropping the future when
/// the lease deadline passes or the system shuts down, so implementations
/// must not assume they run to completion.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use cosci::domain::errors::DomainResult;
/// use cosci::domain::models::{Task, TaskOutcome};
/// use cosci::domain::ports::Collaborator;
///
/// struct Reviewer;
///
/// #[async_trait]
/// impl Collaborator for Reviewer {
///     fn name(&self) -> &str {
///         "reviewer"
///     }
///
///     async fn execute(&self, task: &Task) -> DomainResult<TaskOutcome> {
///         unimplemented!("call the review agent with {:?}", task.payload)
///     }
/// }
/// ```
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run the task and return its outcome.
    async fn execute(&self, task: &Task) -> DomainResult<TaskOutcome>;
}
