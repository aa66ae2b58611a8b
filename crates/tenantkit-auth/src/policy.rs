//! Tenant authentication policy resolution.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tenantkit_api::{AuthMethod, RawTenantMetadata, TenantAuthConfig, TenantId, TenantMetadataSource};

#[cfg(feature = "cache")]
use dashmap::DashMap;
#[cfg(feature = "cache")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "cache")]
use tokio::time::Instant;

use crate::{Error, Result, context};

#[cfg(feature = "cache")]
#[derive(Debug, Clone)]
struct CachedPolicy {
    expires_at: Instant,
    config: Arc<TenantAuthConfig>,
}

/// Per-tenant cache slot. `generation` is bumped by every invalidation.
#[cfg(feature = "cache")]
#[derive(Debug, Default)]
struct CacheSlot {
    generation: u64,
    policy: Option<CachedPolicy>,
}

/// Cache generation observed before a fetch. A snapshot is only stored if
/// neither `invalidate` nor `clear` ran while it was being fetched.
#[cfg(feature = "cache")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Generation {
    epoch: u64,
    tenant: u64,
}

#[cfg(not(feature = "cache"))]
#[derive(Debug, Clone, Copy)]
struct Generation;

/// Resolves tenants to immutable [`TenantAuthConfig`] snapshots.
///
/// A tenant with no stored metadata gets the default policy. A source that
/// cannot be reached is reported as [`Error::PolicyUnavailable`] and never
/// replaced by the default.
pub struct PolicyStore {
    source: Arc<dyn TenantMetadataSource>,
    #[cfg_attr(not(feature = "cache"), allow(dead_code))]
    cache_ttl: Duration,
    #[cfg(feature = "cache")]
    cache: DashMap<TenantId, CacheSlot>,
    #[cfg(feature = "cache")]
    epoch: AtomicU64,
}

impl PolicyStore {
    /// Store without caching.
    pub fn new(source: Arc<dyn TenantMetadataSource>) -> Self {
        Self {
            source,
            cache_ttl: Duration::ZERO,
            #[cfg(feature = "cache")]
            cache: DashMap::new(),
            #[cfg(feature = "cache")]
            epoch: AtomicU64::new(0),
        }
    }

    /// Keep successful resolutions for `ttl`. Zero disables the cache.
    ///
    /// Only effective with the `cache` feature.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Identifier of the backing store, e.g. `static` or `http`.
    #[must_use]
    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    pub async fn resolve(&self, tenant: &TenantId) -> Result<Arc<TenantAuthConfig>> {
        if let Some(config) = self.cached(tenant) {
            tracing::debug!(%tenant, cache = "hit", "resolved tenant policy");
            return Ok(config);
        }

        let seen = self.generation(tenant);
        let raw = self
            .source
            .fetch_tenant_metadata(tenant)
            .await
            .map_err(|e| {
                tracing::warn!(%tenant, source = self.source.id(), error = %e, "tenant policy unavailable");
                Error::PolicyUnavailable(e.to_string())
            })?;

        let config = Arc::new(match raw {
            Some(raw) => policy_from_metadata(tenant, &raw),
            None => TenantAuthConfig::default(),
        });

        self.remember(tenant, &config, seen);
        tracing::debug!(%tenant, cache = "miss", methods = ?config.methods, "resolved tenant policy");
        Ok(config)
    }

    /// Resolve the policy of the ambient tenant.
    pub async fn resolve_current(&self) -> Result<Arc<TenantAuthConfig>> {
        let tenant = context::require()?;
        self.resolve(&tenant).await
    }

    /// Drop the cached snapshot for `tenant`.
    ///
    /// A fetch already in flight for `tenant` is not cached when it completes.
    #[cfg(feature = "cache")]
    pub fn invalidate(&self, tenant: &TenantId) {
        let mut slot = self.cache.entry(tenant.clone()).or_default();
        slot.generation = slot.generation.wrapping_add(1);
        slot.policy = None;
    }

    #[cfg(not(feature = "cache"))]
    pub fn invalidate(&self, _tenant: &TenantId) {}

    /// Drop every cached snapshot, including fetches still in flight.
    #[cfg(feature = "cache")]
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
    }

    #[cfg(not(feature = "cache"))]
    pub fn clear(&self) {}

    #[cfg(feature = "cache")]
    fn cached(&self, tenant: &TenantId) -> Option<Arc<TenantAuthConfig>> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let slot = self.cache.get(tenant)?;
        let cached = slot.policy.as_ref()?;
        (cached.expires_at > Instant::now()).then(|| Arc::clone(&cached.config))
    }

    #[cfg(not(feature = "cache"))]
    fn cached(&self, _tenant: &TenantId) -> Option<Arc<TenantAuthConfig>> {
        None
    }

    #[cfg(feature = "cache")]
    fn generation(&self, tenant: &TenantId) -> Generation {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let tenant = self.cache.get(tenant).map_or(0, |slot| slot.generation);
        Generation { epoch, tenant }
    }

    #[cfg(not(feature = "cache"))]
    fn generation(&self, _tenant: &TenantId) -> Generation {
        Generation
    }

    #[cfg(feature = "cache")]
    fn remember(&self, tenant: &TenantId, config: &Arc<TenantAuthConfig>, seen: Generation) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let Some(expires_at) = Instant::now().checked_add(self.cache_ttl) else {
            tracing::warn!(%tenant, ttl = ?self.cache_ttl, "cache ttl out of range, not caching");
            return;
        };
        // The slot stays locked until the insert, so a concurrent invalidate
        // either lands before the check or after the snapshot is stored.
        let mut slot = self.cache.entry(tenant.clone()).or_default();
        let current = Generation {
            epoch: self.epoch.load(Ordering::SeqCst),
            tenant: slot.generation,
        };
        if current != seen {
            tracing::debug!(%tenant, "policy invalidated during fetch, not caching");
            return;
        }
        slot.policy = Some(CachedPolicy {
            expires_at,
            config: Arc::clone(config),
        });
    }

    #[cfg(not(feature = "cache"))]
    fn remember(&self, _tenant: &TenantId, _config: &Arc<TenantAuthConfig>, _seen: Generation) {}
}

/// Overlay the `auth` object of stored metadata on the default policy.
///
/// Missing or malformed fields keep their default value.
fn policy_from_metadata(tenant: &TenantId, raw: &RawTenantMetadata) -> TenantAuthConfig {
    let mut config = TenantAuthConfig::default();

    let auth = match raw.get("auth") {
        None => return config,
        Some(Value::Object(auth)) => auth,
        Some(other) => {
            tracing::warn!(%tenant, value = %other, "tenant metadata auth is not an object");
            return config;
        }
    };

    if let Some(value) = auth.get("methods") {
        match value.as_array() {
            Some(items) => {
                let mut methods: Vec<AuthMethod> = Vec::new();
                for item in items {
                    match item.as_str().map(str::parse::<AuthMethod>) {
                        Some(Ok(method)) => {
                            if !methods.contains(&method) {
                                methods.push(method);
                            }
                        }
                        _ => tracing::warn!(%tenant, method = %item, "ignoring unknown auth method"),
                    }
                }
                if methods.is_empty() {
                    tracing::warn!(%tenant, "no usable auth methods, keeping defaults");
                } else {
                    config.methods = methods;
                }
            }
            None => tracing::warn!(%tenant, value = %value, "auth.methods is not an array"),
        }
    }

    read_flag(tenant, auth, "allow_signup", &mut config.allow_signup);
    read_flag(
        tenant,
        auth,
        "require_email_verification",
        &mut config.require_email_verification,
    );

    config
}

fn read_flag(tenant: &TenantId, auth: &Map<String, Value>, key: &str, slot: &mut bool) {
    match auth.get(key) {
        None => {}
        Some(Value::Bool(b)) => *slot = *b,
        Some(other) => tracing::warn!(%tenant, key, value = %other, "ignoring non-boolean policy flag"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tenantkit_api::TenantkitError;

    #[derive(Default)]
    struct FakeSource {
        rows: Mutex<HashMap<TenantId, Value>>,
        down: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn put(&self, tenant: &str, meta: Value) {
            self.rows.lock().unwrap().insert(TenantId::new(tenant), meta);
        }
    }

    #[async_trait]
    impl TenantMetadataSource for FakeSource {
        fn id(&self) -> &str {
            "fake"
        }

        async fn fetch_tenant_metadata(
            &self,
            tenant: &TenantId,
        ) -> std::result::Result<Option<Value>, TenantkitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(TenantkitError::Unavailable("connection refused".to_string()));
            }
            Ok(self.rows.lock().unwrap().get(tenant).cloned())
        }
    }

    fn store(source: &Arc<FakeSource>) -> PolicyStore {
        PolicyStore::new(Arc::clone(source) as Arc<dyn TenantMetadataSource>)
    }

    #[tokio::test]
    async fn absent_row_yields_default() {
        let source = Arc::new(FakeSource::default());
        let cfg = store(&source).resolve(&TenantId::new("acme")).await.unwrap();
        assert_eq!(*cfg, TenantAuthConfig::default());
    }

    #[tokio::test]
    async fn unavailable_is_not_defaulted() {
        let source = Arc::new(FakeSource::default());
        source.down.store(true, Ordering::SeqCst);
        let err = store(&source).resolve(&TenantId::new("acme")).await.unwrap_err();
        assert!(matches!(err, Error::PolicyUnavailable(_)));
    }

    #[tokio::test]
    async fn overrides_apply_on_top_of_defaults() {
        let source = Arc::new(FakeSource::default());
        source.put("acme", json!({"auth": {"allow_signup": false}}));
        source.put(
            "globex",
            json!({"auth": {"methods": ["github", "saml", "github", "phone_otp"], "require_email_verification": true}}),
        );
        let store = store(&source);

        let acme = store.resolve(&TenantId::new("acme")).await.unwrap();
        assert!(!acme.allow_signup);
        assert_eq!(acme.methods, TenantAuthConfig::default().methods);

        let globex = store.resolve(&TenantId::new("globex")).await.unwrap();
        assert_eq!(globex.methods, vec![AuthMethod::GitHub, AuthMethod::PhoneOtp]);
        assert!(globex.allow_signup);
        assert!(globex.require_email_verification);
    }

    #[test]
    fn malformed_metadata_keeps_defaults() {
        let tenant = TenantId::new("acme");
        for raw in [
            json!({"auth": "nope"}),
            json!({"auth": {"methods": []}}),
            json!({"auth": {"methods": "google", "allow_signup": "no"}}),
            json!({"plan": "pro"}),
        ] {
            assert_eq!(policy_from_metadata(&tenant, &raw), TenantAuthConfig::default(), "{raw}");
        }
    }

    #[tokio::test]
    async fn resolve_current_needs_a_tenant() {
        let source = Arc::new(FakeSource::default());
        source.put("acme", json!({"auth": {"allow_signup": false}}));
        let store = store(&source);

        assert!(matches!(store.resolve_current().await, Err(Error::MissingTenant)));

        let cfg = context::scope(TenantId::new("acme"), store.resolve_current())
            .await
            .unwrap();
        assert!(!cfg.allow_signup);
    }

    #[cfg(feature = "cache")]
    #[tokio::test(start_paused = true)]
    async fn cache_serves_until_invalidated_or_expired() {
        let source = Arc::new(FakeSource::default());
        let store = store(&source).with_cache_ttl(Duration::from_secs(30));
        let acme = TenantId::new("acme");

        store.resolve(&acme).await.unwrap();
        source.put("acme", json!({"auth": {"allow_signup": false}}));
        assert!(store.resolve(&acme).await.unwrap().allow_signup);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        store.invalidate(&acme);
        assert!(!store.resolve(&acme).await.unwrap().allow_signup);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        store.resolve(&acme).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[cfg(feature = "cache")]
    #[tokio::test]
    async fn failures_are_not_cached() {
        let source = Arc::new(FakeSource::default());
        let store = store(&source).with_cache_ttl(Duration::from_secs(30));
        let acme = TenantId::new("acme");

        source.down.store(true, Ordering::SeqCst);
        assert!(store.resolve(&acme).await.is_err());
        source.down.store(false, Ordering::SeqCst);
        assert!(store.resolve(&acme).await.is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(feature = "cache")]
    #[tokio::test]
    async fn out_of_range_ttl_skips_the_cache() {
        let source = Arc::new(FakeSource::default());
        let store = store(&source).with_cache_ttl(Duration::from_secs(u64::MAX));
        let acme = TenantId::new("acme");

        assert_eq!(*store.resolve(&acme).await.unwrap(), TenantAuthConfig::default());
        store.resolve(&acme).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    /// Holds every fetch open until `release` is notified.
    #[cfg(feature = "cache")]
    #[derive(Default)]
    struct GatedSource {
        inner: FakeSource,
        fetched: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[cfg(feature = "cache")]
    #[async_trait]
    impl TenantMetadataSource for GatedSource {
        fn id(&self) -> &str {
            "gated"
        }

        async fn fetch_tenant_metadata(
            &self,
            tenant: &TenantId,
        ) -> std::result::Result<Option<Value>, TenantkitError> {
            let row = self.inner.fetch_tenant_metadata(tenant).await;
            self.fetched.notify_one();
            self.release.notified().await;
            row
        }
    }

    #[cfg(feature = "cache")]
    async fn change_policy_during_fetch(drop_snapshot: fn(&PolicyStore, &TenantId)) {
        let source = Arc::new(GatedSource::default());
        let store = Arc::new(
            PolicyStore::new(Arc::clone(&source) as Arc<dyn TenantMetadataSource>)
                .with_cache_ttl(Duration::from_secs(30)),
        );
        let acme = TenantId::new("acme");

        let in_flight = tokio::spawn({
            let store = Arc::clone(&store);
            let acme = acme.clone();
            async move { store.resolve(&acme).await }
        });
        source.fetched.notified().await;
        source.inner.put("acme", json!({"auth": {"allow_signup": false}}));
        drop_snapshot(&store, &acme);
        source.release.notify_one();
        assert!(in_flight.await.unwrap().unwrap().allow_signup);

        source.release.notify_one();
        assert!(!store.resolve(&acme).await.unwrap().allow_signup);
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(feature = "cache")]
    #[tokio::test]
    async fn invalidate_discards_fetch_in_flight() {
        change_policy_during_fetch(PolicyStore::invalidate).await;
    }

    #[cfg(feature = "cache")]
    #[tokio::test]
    async fn clear_discards_fetch_in_flight() {
        change_policy_during_fetch(|store, _| store.clear()).await;
    }
}
