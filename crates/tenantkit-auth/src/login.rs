//! Login assessment for the ambient tenant.

use std::sync::Arc;

use serde::Serialize;
use tenantkit_api::{AuthMethod, IdentifierKind, TenantAuthConfig, TenantId};

use crate::{PolicyStore, Result, classify_identifier, context};

/// What the login form may offer for one identifier under one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct LoginAssessment {
    pub tenant: TenantId,
    pub kind: IdentifierKind,
    pub config: Arc<TenantAuthConfig>,
    /// Password sign-in is enabled for the tenant.
    pub password_login: bool,
    /// Enabled OAuth providers, in display order.
    pub oauth_providers: Vec<AuthMethod>,
}

/// Classify `identifier` and pair it with the ambient tenant's policy.
///
/// Must run inside [`context::scope`]; otherwise fails with
/// [`crate::Error::MissingTenant`].
pub async fn assess_login(store: &PolicyStore, identifier: &str) -> Result<LoginAssessment> {
    let tenant = context::require()?;
    let config = store.resolve(&tenant).await?;
    let kind = classify_identifier(identifier.trim());

    Ok(LoginAssessment {
        password_login: config.permits(AuthMethod::EmailPassword),
        oauth_providers: config.oauth_providers().collect(),
        tenant,
        kind,
        config,
    })
}
