//! Tenant derivation helpers.

use tenantkit_api::{TenantId, TenantSource};

/// Raw tenant hints extracted from an inbound request by the routing layer.
#[derive(Debug, Clone, Default)]
pub struct TenantHints<'a> {
    /// Request host, possibly with a port.
    pub host: Option<&'a str>,
    /// Value of the tenant header.
    pub header: Option<&'a str>,
    /// Value of the tenant query parameter.
    pub query: Option<&'a str>,
}

/// Tenant derivation configuration.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// If set, a host like `acme.example.com` will derive tenant `acme`
    /// when `host_root` is `example.com`.
    pub host_root: Option<String>,

    /// Order in which hint sources are consulted.
    pub precedence: Vec<TenantSource>,

    /// Optional allow-list of tenant ids.
    pub allow_list: Option<Vec<String>>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            host_root: None,
            precedence: vec![TenantSource::Host, TenantSource::Header, TenantSource::Query],
            allow_list: None,
        }
    }
}

/// Result of deriving a tenant.
#[derive(Debug, Clone)]
pub struct TenantDecision {
    /// Derived tenant id.
    pub tenant_id: Option<TenantId>,
    /// Source used.
    pub source: TenantSource,
}

impl TenantDecision {
    /// True if a tenant was derived.
    #[must_use]
    pub fn is_some(&self) -> bool {
        self.tenant_id.is_some()
    }
}

/// Derive a tenant id from request hints.
///
/// - Sources are tried in `cfg.precedence` order; the first hit wins.
/// - If `cfg.allow_list` is set, the derived tenant must be in the list.
#[must_use]
pub fn derive_tenant(hints: &TenantHints<'_>, cfg: &TenantConfig) -> TenantDecision {
    let found = cfg.precedence.iter().find_map(|source| {
        let tenant = match source {
            TenantSource::Host => hints
                .host
                .and_then(|h| derive_from_host(h, cfg.host_root.as_deref())),
            TenantSource::Header => hints.header.and_then(derive_from_value),
            TenantSource::Query => hints.query.and_then(derive_from_value),
            TenantSource::None => None,
        };
        tenant.map(|t| (t, *source))
    });

    let found = match (found, &cfg.allow_list) {
        (Some((t, _)), Some(allow)) if !allow.iter().any(|a| a == &t) => None,
        (f, _) => f,
    };

    match found {
        Some((tenant, source)) => TenantDecision {
            tenant_id: Some(TenantId::new(tenant)),
            source,
        },
        None => TenantDecision {
            tenant_id: None,
            source: TenantSource::None,
        },
    }
}

fn derive_from_host(host: &str, host_root: Option<&str>) -> Option<String> {
    let mut host = host.trim().to_lowercase();

    // Strip port, if any.
    if let Some((h, _port)) = host.split_once(':') {
        host = h.to_string();
    }

    let root = host_root?.trim().to_lowercase();
    let root = root.trim_start_matches('.');

    if host == root {
        return None;
    }

    // Require a label boundary so `evilexample.com` does not match `example.com`.
    let prefix = host.strip_suffix(root)?.strip_suffix('.')?;
    if prefix.is_empty() {
        return None;
    }

    // Use the last label of the remaining prefix (supports nested subdomains).
    let tenant = prefix.rsplit('.').next()?.to_string();

    // Basic sanity: [a-z0-9-]
    if !tenant.is_empty()
        && tenant
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        Some(tenant)
    } else {
        None
    }
}

fn derive_from_value(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
