use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tenantkit_api::{RawTenantMetadata, SourceConfig, TenantId, TenantSource, TenantkitError};

pub const SETTINGS_FILE: &str = "settings.toml";
pub const AUTH_API_URL_ENV: &str = "TENANTKIT_AUTH_API_URL";
/// Upper bound for `policy.cache_ttl_seconds` (one day).
pub const MAX_CACHE_TTL_SECONDS: u64 = 86_400;

const DEFAULT_SETTINGS: &str = include_str!("../../../docs/tenantkit/settings.toml.example");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancySettings {
    pub host_root: Option<String>,
    pub precedence: Vec<TenantSource>,
    pub allow_list: Option<Vec<String>>,
}

impl Default for TenancySettings {
    fn default() -> Self {
        Self {
            host_root: None,
            precedence: vec![TenantSource::Host, TenantSource::Header, TenantSource::Query],
            allow_list: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    pub cache_ttl_seconds: u64,
    pub request_timeout_ms: u64,
    pub metadata_url: Option<String>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 60,
            request_timeout_ms: 5_000,
            metadata_url: None,
        }
    }
}

/// Forwarding rule for the authentication backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProxyConfig {
    pub base_url: String,
    pub path_prefix: String,
}

impl Default for AuthProxyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            path_prefix: "/api/auth".to_string(),
        }
    }
}

impl AuthProxyConfig {
    /// Backend URL for `path`, or `None` when the path is outside the prefix.
    ///
    /// The path (and any query string) is forwarded unmodified.
    #[must_use]
    pub fn forward_url(&self, path: &str) -> Option<String> {
        let prefix = self.path_prefix.trim_end_matches('/');
        let rest = path.strip_prefix(prefix)?;
        if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')) {
            return None;
        }
        Some(format!("{}{path}", self.base_url.trim_end_matches('/')))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub tenancy: TenancySettings,
    pub policy: PolicySettings,
    pub auth_proxy: AuthProxyConfig,
    pub tenants: BTreeMap<TenantId, RawTenantMetadata>,
}

impl Settings {
    #[must_use]
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            metadata_url: self.policy.metadata_url.clone(),
            request_timeout_ms: self.policy.request_timeout_ms,
            static_tenants: self.tenants.clone(),
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_with(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(AUTH_API_URL_ENV).filter(|v| !v.trim().is_empty()) {
            tracing::debug!(base_url = %url, "auth proxy base url overridden from environment");
            self.auth_proxy.base_url = url.trim().to_string();
        }
    }
}

pub fn validate_settings(settings: &Settings) -> Result<(), TenantkitError> {
    let base = &settings.auth_proxy.base_url;
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(TenantkitError::Validation(format!(
            "auth_proxy.base_url must be an http(s) url, got {base}"
        )));
    }
    if !settings.auth_proxy.path_prefix.starts_with('/') {
        return Err(TenantkitError::Validation(
            "auth_proxy.path_prefix must start with /".to_string(),
        ));
    }

    let tenancy = &settings.tenancy;
    if tenancy.precedence.is_empty() {
        return Err(TenantkitError::Validation(
            "tenancy.precedence must not be empty".to_string(),
        ));
    }
    for (i, source) in tenancy.precedence.iter().enumerate() {
        if *source == TenantSource::None {
            return Err(TenantkitError::Validation(
                "tenancy.precedence may only list host, header or query".to_string(),
            ));
        }
        if tenancy.precedence[..i].contains(source) {
            return Err(TenantkitError::Validation(format!(
                "tenancy.precedence lists {source:?} twice"
            )));
        }
    }

    if settings.policy.cache_ttl_seconds > MAX_CACHE_TTL_SECONDS {
        return Err(TenantkitError::Validation(format!(
            "policy.cache_ttl_seconds must be at most {MAX_CACHE_TTL_SECONDS}, got {}",
            settings.policy.cache_ttl_seconds
        )));
    }

    if let Some(url) = &settings.policy.metadata_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TenantkitError::Validation(format!(
                "policy.metadata_url must be an http(s) url, got {url}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    #[serde(default)]
    tenancy: RawTenancy,
    #[serde(default)]
    policy: RawPolicy,
    #[serde(default)]
    auth_proxy: RawAuthProxy,
    #[serde(default)]
    tenants: BTreeMap<String, RawTenantMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTenancy {
    host_root: Option<String>,
    precedence: Option<Vec<TenantSource>>,
    #[serde(default)]
    allow_list: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPolicy {
    cache_ttl_seconds: Option<u64>,
    request_timeout_ms: Option<u64>,
    metadata_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthProxy {
    base_url: Option<String>,
    path_prefix: Option<String>,
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("tenantkit")
    } else {
        PathBuf::from(".tenantkit")
    }
}

pub fn load_settings_from_dir(dir: &Path) -> Result<Settings, TenantkitError> {
    load_settings_from_file(&dir.join(SETTINGS_FILE))
}

pub fn load_settings_from_file(path: &Path) -> Result<Settings, TenantkitError> {
    let content = fs::read_to_string(path)
        .map_err(|e| TenantkitError::NotFound(format!("failed to read {}: {e}", path.display())))?;
    let mut settings = parse_settings(&content, path)?;
    settings.apply_env_overrides();
    validate_settings(&settings)?;
    Ok(settings)
}

/// Parse settings TOML. `origin` is only used in error messages.
pub fn parse_settings(content: &str, origin: &Path) -> Result<Settings, TenantkitError> {
    let raw: RawSettings = toml::from_str(content).map_err(|e| {
        TenantkitError::Validation(format!("invalid TOML in {}: {e}", origin.display()))
    })?;

    let defaults = Settings::default();

    let tenancy = TenancySettings {
        host_root: raw.tenancy.host_root.filter(|r| !r.trim().is_empty()),
        precedence: raw
            .tenancy
            .precedence
            .unwrap_or(defaults.tenancy.precedence),
        allow_list: if raw.tenancy.allow_list.is_empty() {
            None
        } else {
            Some(raw.tenancy.allow_list)
        },
    };

    let policy = PolicySettings {
        cache_ttl_seconds: raw
            .policy
            .cache_ttl_seconds
            .unwrap_or(defaults.policy.cache_ttl_seconds),
        request_timeout_ms: raw
            .policy
            .request_timeout_ms
            .unwrap_or(defaults.policy.request_timeout_ms),
        metadata_url: raw.policy.metadata_url,
    };

    let auth_proxy = AuthProxyConfig {
        base_url: raw
            .auth_proxy
            .base_url
            .unwrap_or(defaults.auth_proxy.base_url),
        path_prefix: raw
            .auth_proxy
            .path_prefix
            .unwrap_or(defaults.auth_proxy.path_prefix),
    };

    let tenants = raw
        .tenants
        .into_iter()
        .map(|(id, meta)| {
            let id = TenantId::parse(&id).map_err(|e| {
                TenantkitError::Validation(format!("{}: tenants: {e}", origin.display()))
            })?;
            Ok((id, meta))
        })
        .collect::<Result<BTreeMap<_, _>, TenantkitError>>()?;

    let settings = Settings {
        tenancy,
        policy,
        auth_proxy,
        tenants,
    };
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn write_default_config_files(dir: &Path, force: bool) -> Result<PathBuf, TenantkitError> {
    fs::create_dir_all(dir)
        .map_err(|e| TenantkitError::Internal(format!("failed to create {}: {e}", dir.display())))?;

    let path = dir.join(SETTINGS_FILE);
    if force || !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS).map_err(|e| {
            TenantkitError::Internal(format!("failed to write {}: {e}", path.display()))
        })?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> &'static Path {
        Path::new("settings.toml")
    }

    #[test]
    fn bundled_example_parses() {
        let settings = parse_settings(DEFAULT_SETTINGS, origin()).unwrap();
        assert_eq!(settings.tenancy.host_root.as_deref(), Some("example.com"));
        assert_eq!(settings.auth_proxy.path_prefix, "/api/auth");
        let acme = settings.tenants.get(&TenantId::new("acme")).unwrap();
        assert_eq!(acme["auth"]["allow_signup"], serde_json::json!(false));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let settings = parse_settings("", origin()).unwrap();
        assert_eq!(settings.tenancy.precedence.len(), 3);
        assert_eq!(settings.policy.cache_ttl_seconds, 60);
        assert!(settings.tenancy.allow_list.is_none());
        assert!(settings.tenants.is_empty());
    }

    #[test]
    fn rejects_duplicate_precedence() {
        let err = parse_settings("[tenancy]\nprecedence = [\"host\", \"host\"]\n", origin())
            .unwrap_err();
        assert!(matches!(err, TenantkitError::Validation(_)));
    }

    #[test]
    fn rejects_unbounded_cache_ttl() {
        let err = parse_settings("[policy]\ncache_ttl_seconds = 9223372036854775807\n", origin())
            .unwrap_err();
        assert!(err.to_string().contains("cache_ttl_seconds"));

        let day = format!("[policy]\ncache_ttl_seconds = {MAX_CACHE_TTL_SECONDS}\n");
        assert!(parse_settings(&day, origin()).is_ok());
    }

    #[test]
    fn unknown_tenancy_keys_are_ignored() {
        let settings = parse_settings(
            "[tenancy]\nhost_root = \"example.com\"\nheader_name = \"x-tenant-id\"\n",
            origin(),
        )
        .unwrap();
        assert_eq!(settings.tenancy.host_root.as_deref(), Some("example.com"));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let err = parse_settings("[auth_proxy]\nbase_url = \"ftp://x\"\n", origin()).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn env_override_replaces_base_url() {
        let mut settings = Settings::default();
        settings.apply_overrides_with(|k| {
            (k == AUTH_API_URL_ENV).then(|| "https://auth.internal:9000".to_string())
        });
        assert_eq!(settings.auth_proxy.base_url, "https://auth.internal:9000");

        settings.apply_overrides_with(|_| Some("  ".to_string()));
        assert_eq!(settings.auth_proxy.base_url, "https://auth.internal:9000");
    }

    #[test]
    fn proxy_forwards_only_under_prefix() {
        let proxy = AuthProxyConfig {
            base_url: "http://backend:8000/".to_string(),
            path_prefix: "/api/auth".to_string(),
        };
        assert_eq!(
            proxy.forward_url("/api/auth/session").as_deref(),
            Some("http://backend:8000/api/auth/session")
        );
        assert_eq!(
            proxy.forward_url("/api/auth?next=/home").as_deref(),
            Some("http://backend:8000/api/auth?next=/home")
        );
        assert_eq!(proxy.forward_url("/api/authz"), None);
        assert_eq!(proxy.forward_url("/api/other"), None);
    }

    #[test]
    fn writes_default_file_once() {
        let dir = std::env::temp_dir().join(format!("tenantkit-core-{}", std::process::id()));
        let path = write_default_config_files(&dir, false).unwrap();
        fs::write(&path, "# edited\n").unwrap();
        write_default_config_files(&dir, false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# edited\n");
        write_default_config_files(&dir, true).unwrap();
        assert!(load_settings_from_dir(&dir).is_ok());
        let _ = fs::remove_dir_all(&dir);
    }
}
