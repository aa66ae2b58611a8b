use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tenantkit_api::{
    RawTenantMetadata, SourceConfig, SourceFactory, TenantId, TenantMetadataSource, TenantkitError,
};

/// In-memory metadata store, seeded from settings and editable at runtime.
pub struct StaticMetadataSource {
    id: String,
    rows: RwLock<BTreeMap<TenantId, RawTenantMetadata>>,
}

impl StaticMetadataSource {
    pub fn new(id: impl Into<String>, rows: BTreeMap<TenantId, RawTenantMetadata>) -> Self {
        Self {
            id: id.into(),
            rows: RwLock::new(rows),
        }
    }

    pub fn upsert(&self, tenant: TenantId, metadata: RawTenantMetadata) -> Result<(), TenantkitError> {
        let mut guard = self
            .rows
            .write()
            .map_err(|_| TenantkitError::Internal("metadata store poisoned".to_string()))?;
        guard.insert(tenant, metadata);
        Ok(())
    }

    pub fn remove(&self, tenant: &TenantId) -> Result<Option<RawTenantMetadata>, TenantkitError> {
        let mut guard = self
            .rows
            .write()
            .map_err(|_| TenantkitError::Internal("metadata store poisoned".to_string()))?;
        Ok(guard.remove(tenant))
    }
}

#[async_trait]
impl TenantMetadataSource for StaticMetadataSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_tenant_metadata(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<RawTenantMetadata>, TenantkitError> {
        let guard = self
            .rows
            .read()
            .map_err(|_| TenantkitError::Internal("metadata store poisoned".to_string()))?;
        Ok(guard.get(tenant).cloned())
    }
}

#[cfg(feature = "fetch-reqwest")]
pub use http::HttpMetadataSource;

#[cfg(feature = "fetch-reqwest")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{StatusCode, Url};
    use tenantkit_api::{RawTenantMetadata, TenantId, TenantMetadataSource, TenantkitError};

    /// Reads tenant metadata from `GET {base_url}/tenants/{id}/metadata`.
    ///
    /// `404` is an absent row. Transport failures and `5xx` are reported as
    /// [`TenantkitError::Unavailable`].
    pub struct HttpMetadataSource {
        id: String,
        base_url: Url,
        client: reqwest::Client,
    }

    impl HttpMetadataSource {
        pub fn new(
            id: impl Into<String>,
            base_url: &str,
            timeout: Duration,
        ) -> Result<Self, TenantkitError> {
            let base_url = Url::parse(base_url)
                .map_err(|e| TenantkitError::Config(format!("invalid metadata url {base_url}: {e}")))?;
            if base_url.cannot_be_a_base() {
                return Err(TenantkitError::Config(format!(
                    "metadata url {base_url} cannot be a base"
                )));
            }
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TenantkitError::Config(format!("failed to build http client: {e}")))?;
            Ok(Self {
                id: id.into(),
                base_url,
                client,
            })
        }

        pub(crate) fn metadata_url(&self, tenant: &TenantId) -> Url {
            let mut url = self.base_url.clone();
            if let Ok(mut segments) = url.path_segments_mut() {
                segments
                    .pop_if_empty()
                    .extend(["tenants", tenant.as_str(), "metadata"]);
            }
            url
        }
    }

    #[async_trait]
    impl TenantMetadataSource for HttpMetadataSource {
        fn id(&self) -> &str {
            &self.id
        }

        async fn fetch_tenant_metadata(
            &self,
            tenant: &TenantId,
        ) -> Result<Option<RawTenantMetadata>, TenantkitError> {
            let url = self.metadata_url(tenant);
            tracing::debug!(%tenant, %url, "fetching tenant metadata");

            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| TenantkitError::Unavailable(format!("metadata request failed: {e}")))?;

            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if status.is_server_error() {
                return Err(TenantkitError::Unavailable(format!(
                    "metadata store returned {status}"
                )));
            }
            if !status.is_success() {
                return Err(TenantkitError::Internal(format!(
                    "metadata store rejected request: {status}"
                )));
            }

            let body = resp
                .json::<RawTenantMetadata>()
                .await
                .map_err(|e| TenantkitError::Internal(format!("invalid metadata body: {e}")))?;
            Ok(Some(body))
        }
    }
}

#[derive(Default)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn build(&self, cfg: &SourceConfig) -> Result<Box<dyn TenantMetadataSource>, TenantkitError> {
        match cfg.metadata_url.as_deref() {
            None => Ok(Box::new(StaticMetadataSource::new(
                "static",
                cfg.static_tenants.clone(),
            ))),
            #[cfg(feature = "fetch-reqwest")]
            Some(url) => Ok(Box::new(HttpMetadataSource::new(
                "http",
                url,
                std::time::Duration::from_millis(cfg.request_timeout_ms),
            )?)),
            #[cfg(not(feature = "fetch-reqwest"))]
            Some(_) => Err(TenantkitError::Config(
                "metadata_url requires the fetch-reqwest feature".to_string(),
            )),
        }
    }
}
