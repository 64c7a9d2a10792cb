use crate::{
    api,
    identity::{
        Argon2Hasher, CredentialStore, HmacSigner, IdentityConfig, Orchestrator, RoleRegistry,
        memory::MemoryStore, postgres::PgStore,
    },
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub jwt_secret: SecretString,
    pub config: IdentityConfig,
    pub seed_roles: Vec<String>,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing secret is rejected, the database is
/// unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let signer = HmacSigner::new(&args.jwt_secret).context("invalid --jwt-secret")?;
    let hasher = Argon2Hasher::new();

    let (credentials, roles): (Arc<dyn CredentialStore>, Arc<dyn RoleRegistry>) =
        if let Some(dsn) = &args.dsn {
            let store = Arc::new(PgStore::connect(dsn).await?);
            store.migrate().await?;
            (store.clone(), store)
        } else {
            warn!("No --dsn given, identities are kept in memory and lost on exit");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store)
        };

    let orchestrator = Orchestrator::new(
        args.config,
        credentials,
        roles,
        Arc::new(hasher),
        Arc::new(signer),
    )
    .context("invalid token configuration")?;

    orchestrator
        .seed_roles(&args.seed_roles)
        .await
        .context("Failed to seed roles")?;
    orchestrator
        .warm_up()
        .await
        .context("Failed to prepare password verification")?;

    api::new(args.port, Arc::new(orchestrator)).await
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "storage",
            args.dsn
                .as_deref()
                .map_or_else(|| "memory".to_string(), redact_dsn),
        ),
        ("issuer", args.config.issuer().to_string()),
        ("audience", args.config.audience().to_string()),
        (
            "token_lifetime",
            format!("{}h", args.config.token_lifetime_hours()),
        ),
        (
            "lockout",
            format!(
                "{} attempts / {}m",
                args.config.lockout_max_attempts(),
                args.config.lockout_minutes()
            ),
        ),
        (
            "require_confirmed_email",
            args.config.require_confirmed_email().to_string(),
        ),
        ("admin_role", args.config.admin_role().to_string()),
        ("seed_roles", args.seed_roles.join(",")),
    ];
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "gatekeeper {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}
