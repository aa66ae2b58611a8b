use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tenantkit_api::{
    SourceFactory, TenantAuthConfig, TenantId, TenantMetadataSource, TenantkitError,
};
use tenantkit_auth::{
    Error, LoginAssessment, PolicyStore, TenantConfig, TenantDecision, TenantHints, assess_login,
    context, derive_tenant,
};
use tenantkit_connectors::DefaultSourceFactory;
use tenantkit_core::{AuthProxyConfig, Settings, validate_settings};
use tracing::Instrument;

/// Entry point for tenant-scoped request handling.
pub struct TenantRuntime {
    tenancy: TenantConfig,
    policies: PolicyStore,
    auth_proxy: AuthProxyConfig,
}

impl TenantRuntime {
    pub fn from_settings(settings: &Settings) -> Result<Self, TenantkitError> {
        Self::from_settings_with_factory(settings, &DefaultSourceFactory)
    }

    pub fn from_settings_with_factory(
        settings: &Settings,
        factory: &dyn SourceFactory,
    ) -> Result<Self, TenantkitError> {
        let source: Arc<dyn TenantMetadataSource> = Arc::from(factory.build(&settings.source_config())?);
        Self::with_source(settings, source)
    }

    pub fn with_source(
        settings: &Settings,
        source: Arc<dyn TenantMetadataSource>,
    ) -> Result<Self, TenantkitError> {
        validate_settings(settings)?;

        let tenancy = TenantConfig {
            host_root: settings.tenancy.host_root.clone(),
            precedence: settings.tenancy.precedence.clone(),
            allow_list: settings.tenancy.allow_list.clone(),
        };
        let policies = PolicyStore::new(source)
            .with_cache_ttl(Duration::from_secs(settings.policy.cache_ttl_seconds));

        Ok(Self {
            tenancy,
            policies,
            auth_proxy: settings.auth_proxy.clone(),
        })
    }

    #[must_use]
    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    #[must_use]
    pub fn derive(&self, hints: &TenantHints<'_>) -> TenantDecision {
        derive_tenant(hints, &self.tenancy)
    }

    /// Run `fut` with the tenant derived from `hints` in scope.
    ///
    /// Fails with [`Error::MissingTenant`] when no tenant can be derived.
    pub async fn handle<F>(&self, hints: &TenantHints<'_>, fut: F) -> Result<F::Output, Error>
    where
        F: Future,
    {
        let decision = self.derive(hints);
        let Some(tenant) = decision.tenant_id else {
            tracing::debug!(?hints, "no tenant derived for request");
            return Err(Error::MissingTenant);
        };
        let span = tracing::info_span!(
            "tenant_request",
            tenant = %tenant,
            source = ?decision.source,
            policy_source = self.policies.source_id(),
        );
        Ok(self.handle_as(tenant, fut).instrument(span).await)
    }

    /// Run `fut` with an already known tenant in scope.
    pub async fn handle_as<F>(&self, tenant: TenantId, fut: F) -> F::Output
    where
        F: Future,
    {
        context::scope(tenant, async {
            tracing::info!("handling tenant request");
            fut.await
        })
        .await
    }

    pub async fn login(
        &self,
        hints: &TenantHints<'_>,
        identifier: &str,
    ) -> Result<LoginAssessment, Error> {
        self.handle(hints, assess_login(&self.policies, identifier))
            .await?
    }

    pub async fn policy(&self, hints: &TenantHints<'_>) -> Result<Arc<TenantAuthConfig>, Error> {
        self.handle(hints, self.policies.resolve_current()).await?
    }

    /// Backend URL for a request path under the auth proxy prefix.
    #[must_use]
    pub fn auth_proxy_target(&self, path: &str) -> Option<String> {
        let target = self.auth_proxy.forward_url(path);
        tracing::debug!(path, target = ?target, "auth proxy lookup");
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use serde_json::json;
    use tenantkit_api::{AuthMethod, IdentifierKind, TenantSource};
    use tenantkit_connectors::StaticMetadataSource;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.tenancy.host_root = Some("example.com".to_string());
        settings.auth_proxy.base_url = "http://auth:8000".to_string();
        settings.tenants = BTreeMap::from([(
            TenantId::new("acme"),
            json!({"auth": {"methods": ["email_password", "github"], "allow_signup": false}}),
        )]);
        settings
    }

    fn host(h: &str) -> TenantHints<'_> {
        TenantHints {
            host: Some(h),
            ..TenantHints::default()
        }
    }

    #[tokio::test]
    async fn login_uses_host_tenant_policy() {
        let runtime = TenantRuntime::from_settings(&settings()).unwrap();

        let acme = runtime.login(&host("acme.example.com"), "555-123-4567").await.unwrap();
        assert_eq!(acme.tenant, TenantId::new("acme"));
        assert_eq!(acme.kind, IdentifierKind::Phone);
        assert_eq!(acme.oauth_providers, vec![AuthMethod::GitHub]);
        assert!(!acme.config.allow_signup);

        let globex = runtime.policy(&host("globex.example.com")).await.unwrap();
        assert_eq!(*globex, TenantAuthConfig::default());
    }

    #[tokio::test]
    async fn request_without_tenant_is_rejected() {
        let runtime = TenantRuntime::from_settings(&settings()).unwrap();
        let err = runtime.login(&host("example.com"), "jdoe").await.unwrap_err();
        assert!(matches!(err, Error::MissingTenant));
    }

    #[tokio::test]
    async fn handle_scopes_nested_work() {
        let runtime = TenantRuntime::from_settings(&settings()).unwrap();
        let hints = TenantHints {
            header: Some("initech"),
            ..TenantHints::default()
        };
        assert_eq!(runtime.derive(&hints).source, TenantSource::Header);

        let seen = runtime
            .handle(&hints, async {
                context::spawn(async { context::current() }).await.unwrap()
            })
            .await
            .unwrap();
        assert_eq!(seen, Some(TenantId::new("initech")));
        assert_eq!(context::current(), None);
    }

    #[tokio::test]
    async fn policy_changes_visible_after_invalidate() {
        let source = Arc::new(StaticMetadataSource::new("static", BTreeMap::new()));
        let runtime = TenantRuntime::with_source(&settings(), Arc::clone(&source) as Arc<dyn TenantMetadataSource>).unwrap();
        let hints = host("acme.example.com");

        assert!(runtime.policy(&hints).await.unwrap().allow_signup);
        source
            .upsert(TenantId::new("acme"), json!({"auth": {"allow_signup": false}}))
            .unwrap();
        assert!(runtime.policy(&hints).await.unwrap().allow_signup);

        runtime.policies().invalidate(&TenantId::new("acme"));
        assert!(!runtime.policy(&hints).await.unwrap().allow_signup);
    }

    #[test]
    fn policy_source_follows_settings() {
        let runtime = TenantRuntime::from_settings(&settings()).unwrap();
        assert_eq!(runtime.policies().source_id(), "static");

        let mut remote = settings();
        remote.policy.metadata_url = Some("http://127.0.0.1:8787".to_string());
        let runtime = TenantRuntime::from_settings(&remote).unwrap();
        assert_eq!(runtime.policies().source_id(), "http");
    }

    #[test]
    fn oversized_cache_ttl_is_rejected() {
        let mut bad = settings();
        bad.policy.cache_ttl_seconds = u64::MAX;
        assert!(matches!(
            TenantRuntime::from_settings(&bad),
            Err(TenantkitError::Validation(_))
        ));
    }

    #[test]
    fn auth_proxy_target_follows_prefix() {
        let runtime = TenantRuntime::from_settings(&settings()).unwrap();
        assert_eq!(
            runtime.auth_proxy_target("/api/auth/session").as_deref(),
            Some("http://auth:8000/api/auth/session")
        );
        assert_eq!(runtime.auth_proxy_target("/api/other"), None);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut bad = settings();
        bad.tenancy.precedence.clear();
        assert!(matches!(
            TenantRuntime::from_settings(&bad),
            Err(TenantkitError::Validation(_))
        ));
    }
}
