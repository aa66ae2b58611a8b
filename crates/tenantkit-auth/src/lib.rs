//! tenantkit-auth
//!
//! Tenant-aware authentication helpers. It covers four recurring problems:
//!
//! - **Deriving a tenant** from request host, header or query hints
//! - **Carrying the tenant** through an async call chain without threading it
//!   through every signature ([`context`])
//! - **Resolving the tenant's auth policy** against a metadata store, with a
//!   default for tenants that have none
//! - **Classifying login identifiers** as email, phone or username
//!
//! ## Quick start
//! ```no_run
//! use std::sync::Arc;
//! use tenantkit_api::TenantId;
//! use tenantkit_auth::{PolicyStore, assess_login, context};
//!
//! # async fn demo(source: Arc<dyn tenantkit_api::TenantMetadataSource>) -> tenantkit_auth::Result<()> {
//! let store = PolicyStore::new(source);
//! let assessment = context::scope(TenantId::new("acme"), async {
//!     assess_login(&store, "jane@acme.io").await
//! })
//! .await?;
//!
//! println!("kind={} password={}", assessment.kind, assessment.password_login);
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

pub mod context;
mod error;
mod identifier;
mod login;
mod policy;
mod tenant;

pub use error::{Error, Result};
pub use identifier::classify_identifier;
pub use login::{LoginAssessment, assess_login};
pub use policy::PolicyStore;
pub use tenant::{TenantConfig, TenantDecision, TenantHints, derive_tenant};
