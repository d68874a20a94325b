//! Configuration of page level mutations exposed to the embedding system.

/// What an insert does when the entry does not fit into the page.
///
/// The placement layer checks fit before inserting, so hitting the guard means a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpacePolicy {
    /// Return [`crate::slotted_page::SlottedPageError::InsufficientSpace`] and leave the page intact.
    #[default]
    ReturnError,
    /// Panic. For deployments that prefer crashing over continuing past a caller bug.
    Abort,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MutatorConfig {
    pub space_policy: SpacePolicy,
}

impl MutatorConfig {
    pub fn with_space_policy(mut self, space_policy: SpacePolicy) -> Self {
        self.space_policy = space_policy;
        self
    }
}
