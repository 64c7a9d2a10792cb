use crate::{
    cli::{
        actions::{Action, server::Args},
        commands::{policy, token},
    },
    identity::IdentityConfig,
};
use anyhow::{Context, Result, bail};
use url::Url;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);

    let dsn = matches.get_one::<String>("dsn").cloned();
    if let Some(dsn) = &dsn {
        validate_dsn(dsn)?;
    }

    let token = token::Options::parse(matches)?;
    let policy = policy::Options::parse(matches)?;

    let config = IdentityConfig::new()
        .with_password_min_length(policy.password_min_length)
        .with_username_min_length(policy.username_min_length)
        .with_lockout_max_attempts(policy.lockout_max_attempts)
        .with_lockout_minutes(policy.lockout_minutes)
        .with_require_confirmed_email(policy.require_confirmed_email)
        .with_admin_role(policy.admin_role)
        .with_token_lifetime_hours(token.expire_hours)
        .with_issuer(token.issuer)
        .with_audience(token.audience);

    Ok(Action::Server(Args {
        port,
        dsn,
        jwt_secret: token.secret,
        config,
        seed_roles: policy.seed_roles,
    }))
}

fn validate_dsn(dsn: &str) -> Result<()> {
    let url = Url::parse(dsn).context("invalid GATEKEEPER_DSN")?;
    match url.scheme() {
        "postgres" | "postgresql" => Ok(()),
        other => bail!("unsupported DSN scheme '{other}', expected postgres"),
    }
}
