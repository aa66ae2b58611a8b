mod logging;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tenantkit_api::{TenantAuthConfig, TenantId, TenantkitError};
use tenantkit_auth::{TenantHints, assess_login, classify_identifier};
use tenantkit_core::{
    Settings, default_config_dir, load_settings_from_dir, write_default_config_files,
};
use tenantkit_runtime::TenantRuntime;

#[derive(Debug, Parser)]
#[command(name = "tenantkit", about = "tenantkit CLI: tenant auth policy and login identifier tooling")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write the default settings file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Classify a login identifier as email, phone or username
    Classify { input: String },
    /// Resolve a tenant's authentication policy
    Policy {
        #[command(flatten)]
        tenant: TenantArgs,
    },
    /// Assess a login attempt under a tenant
    Login {
        identifier: String,
        #[command(flatten)]
        tenant: TenantArgs,
    },
    /// Show where an auth request path is forwarded
    Proxy { path: String },
}

#[derive(Debug, Args)]
struct TenantArgs {
    /// Tenant id, bypassing derivation
    #[arg(long, conflicts_with_all = ["host", "header", "query"])]
    tenant: Option<String>,
    /// Request host, e.g. acme.example.com
    #[arg(long)]
    host: Option<String>,
    /// Tenant header value
    #[arg(long)]
    header: Option<String>,
    /// Tenant query parameter value
    #[arg(long)]
    query: Option<String>,
}

impl TenantArgs {
    fn explicit(&self) -> anyhow::Result<Option<TenantId>> {
        Ok(self.tenant.as_deref().map(TenantId::parse).transpose()?)
    }

    fn hints(&self) -> anyhow::Result<TenantHints<'_>> {
        if self.host.is_none() && self.header.is_none() && self.query.is_none() {
            anyhow::bail!("pass one of --tenant, --host, --header or --query");
        }
        Ok(TenantHints {
            host: self.host.as_deref(),
            header: self.header.as_deref(),
            query: self.query.as_deref(),
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.json);
    let cfg_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);

    match cli.command {
        Commands::Init { force } => {
            let path = write_default_config_files(&cfg_dir, force)?;
            pout(
                cli.json,
                serde_json::json!({"message": "init complete", "settings": path}),
                &format!("Init complete: {}", path.display()),
            )?;
        }
        Commands::Classify { input } => {
            let kind = classify_identifier(&input);
            pout(
                cli.json,
                serde_json::json!({"input": input, "kind": kind}),
                &kind.to_string(),
            )?;
        }
        Commands::Policy { tenant } => {
            let runtime = TenantRuntime::from_settings(&load_settings(&cfg_dir)?)?;
            let policy = match tenant.explicit()? {
                Some(id) => {
                    runtime
                        .handle_as(id, runtime.policies().resolve_current())
                        .await?
                }
                None => runtime.policy(&tenant.hints()?).await?,
            };
            pout(cli.json, serde_json::to_value(&*policy)?, &policy_text(&policy))?;
        }
        Commands::Login { identifier, tenant } => {
            let runtime = TenantRuntime::from_settings(&load_settings(&cfg_dir)?)?;
            let assessment = match tenant.explicit()? {
                Some(id) => {
                    runtime
                        .handle_as(id, assess_login(runtime.policies(), &identifier))
                        .await?
                }
                None => runtime.login(&tenant.hints()?, &identifier).await?,
            };
            let text = format!(
                "tenant: {}\nkind: {}\n{}",
                assessment.tenant,
                assessment.kind,
                policy_text(&assessment.config)
            );
            pout(cli.json, serde_json::to_value(&assessment)?, &text)?;
        }
        Commands::Proxy { path } => {
            let runtime = TenantRuntime::from_settings(&load_settings(&cfg_dir)?)?;
            let Some(target) = runtime.auth_proxy_target(&path) else {
                anyhow::bail!("{path} is not under the auth proxy prefix");
            };
            pout(
                cli.json,
                serde_json::json!({"path": &path, "target": &target}),
                &target,
            )?;
        }
    }

    Ok(())
}

/// Settings from `dir`, or built-in defaults when no settings file exists yet.
fn load_settings(dir: &std::path::Path) -> anyhow::Result<Settings> {
    match load_settings_from_dir(dir) {
        Ok(settings) => Ok(settings),
        Err(TenantkitError::NotFound(reason)) => {
            tracing::debug!(%reason, "no settings file, using defaults");
            let mut settings = Settings::default();
            settings.apply_env_overrides();
            Ok(settings)
        }
        Err(e) => Err(e.into()),
    }
}

fn policy_text(policy: &TenantAuthConfig) -> String {
    let methods: Vec<&str> = policy.methods.iter().map(|m| m.as_str()).collect();
    format!(
        "methods: {}\nallow_signup: {}\nrequire_email_verification: {}",
        methods.join(", "),
        policy.allow_signup,
        policy.require_email_verification
    )
}

pub fn pout(json_mode: bool, value: serde_json::Value, text: &str) -> anyhow::Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}
