use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque metadata document returned by a tenant backing store.
pub type RawTenantMetadata = Value;

/// Opaque tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an externally supplied identifier, rejecting blank input.
    pub fn parse(raw: &str) -> Result<Self, TenantkitError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TenantkitError::Validation(
                "tenant id must not be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    EmailPassword,
    Google,
    #[serde(rename = "github")]
    GitHub,
    PhoneOtp,
}

impl AuthMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::EmailPassword => "email_password",
            AuthMethod::Google => "google",
            AuthMethod::GitHub => "github",
            AuthMethod::PhoneOtp => "phone_otp",
        }
    }

    /// True for methods that redirect to a third-party identity provider.
    #[must_use]
    pub fn is_oauth(self) -> bool {
        matches!(self, AuthMethod::Google | AuthMethod::GitHub)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = TenantkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_password" => Ok(AuthMethod::EmailPassword),
            "google" => Ok(AuthMethod::Google),
            "github" => Ok(AuthMethod::GitHub),
            "phone_otp" => Ok(AuthMethod::PhoneOtp),
            other => Err(TenantkitError::Validation(format!(
                "unknown auth method {other}"
            ))),
        }
    }
}

/// Methods enabled for a tenant without an explicit policy.
pub const DEFAULT_AUTH_METHODS: [AuthMethod; 3] =
    [AuthMethod::EmailPassword, AuthMethod::Google, AuthMethod::GitHub];

/// Authentication policy snapshot for one tenant.
///
/// `methods` is never empty and is kept in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAuthConfig {
    pub methods: Vec<AuthMethod>,
    pub allow_signup: bool,
    pub require_email_verification: bool,
}

impl Default for TenantAuthConfig {
    fn default() -> Self {
        Self {
            methods: DEFAULT_AUTH_METHODS.to_vec(),
            allow_signup: true,
            require_email_verification: false,
        }
    }
}

impl TenantAuthConfig {
    #[must_use]
    pub fn permits(&self, method: AuthMethod) -> bool {
        self.methods.contains(&method)
    }

    pub fn oauth_providers(&self) -> impl Iterator<Item = AuthMethod> + '_ {
        self.methods.iter().copied().filter(|m| m.is_oauth())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Email,
    Phone,
    Username,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentifierKind::Email => "email",
            IdentifierKind::Phone => "phone",
            IdentifierKind::Username => "username",
        })
    }
}

/// Where a tenant decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantSource {
    /// Derived from the request host (subdomain).
    Host,
    /// Taken from a request header.
    Header,
    /// Taken from a query parameter.
    Query,
    /// No tenant could be derived.
    None,
}

/// How a metadata source is wired up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    pub metadata_url: Option<String>,
    pub request_timeout_ms: u64,
    pub static_tenants: BTreeMap<TenantId, RawTenantMetadata>,
}

#[derive(Debug, thiserror::Error)]
pub enum TenantkitError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Persistence collaborator that holds per-tenant metadata.
///
/// `Ok(None)` means the tenant has no stored row. `Err` means the store
/// could not be consulted at all.
#[async_trait]
pub trait TenantMetadataSource: Send + Sync {
    fn id(&self) -> &str;

    async fn fetch_tenant_metadata(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<RawTenantMetadata>, TenantkitError>;
}

pub trait SourceFactory: Send + Sync {
    fn build(&self, cfg: &SourceConfig) -> Result<Box<dyn TenantMetadataSource>, TenantkitError>;
}
