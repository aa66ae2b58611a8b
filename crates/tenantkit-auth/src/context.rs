//! Request-scoped tenant context.
//!
//! The tenant lives in a tokio task-local, so it follows the logical task
//! across `.await` points rather than the worker thread. A scope is torn down
//! when its future completes, fails or is dropped, and nested scopes shadow
//! the outer value until they end.
//!
//! Tasks started with a bare `tokio::spawn` do not see the caller's tenant.
//! Use [`spawn`] to hand the current tenant to a child task.

use std::future::Future;

use tenantkit_api::TenantId;
use tokio::task::JoinHandle;

use crate::{Error, Result};

tokio::task_local! {
    static CURRENT_TENANT: TenantId;
}

/// Run `fut` with `tenant` as the ambient tenant.
pub async fn scope<F>(tenant: TenantId, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TENANT.scope(tenant, fut).await
}

/// Synchronous counterpart of [`scope`].
pub fn sync_scope<F, R>(tenant: TenantId, f: F) -> R
where
    F: FnOnce() -> R,
{
    CURRENT_TENANT.sync_scope(tenant, f)
}

/// The ambient tenant, or `None` outside any scope.
#[must_use]
pub fn current() -> Option<TenantId> {
    CURRENT_TENANT.try_with(Clone::clone).ok()
}

/// The ambient tenant, failing with [`Error::MissingTenant`] outside any scope.
pub fn require() -> Result<TenantId> {
    current().ok_or(Error::MissingTenant)
}

/// Spawn a task that inherits the caller's tenant, if there is one.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(tenant) => tokio::spawn(CURRENT_TENANT.scope(tenant, fut)),
        None => tokio::spawn(fut),
    }
}
