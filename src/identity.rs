//! Caller identity carried across the bus.
//!
//! The identity of the request being served lives in a task-local scope.
//! Publishers read it with [`Identity::current`]; the delivery pump restores
//! the identity of each consumed message around its handler so that anything
//! the handler publishes inherits it.

use std::future::Future;

tokio::task_local! {
    static CURRENT: Identity;
}

/// Tenant resource path and user that originated a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Identity {
    pub resource_path: String,
    pub user_id: String,
}

impl Identity {
    pub fn new(resource_path: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            resource_path: resource_path.into(),
            user_id: user_id.into(),
        }
    }

    /// Identity of the enclosing scope, or the empty identity outside one.
    pub fn current() -> Identity {
        CURRENT.try_with(Clone::clone).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.resource_path.is_empty() && self.user_id.is_empty()
    }

    /// Run `fut` with this identity as the current one.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }
}
