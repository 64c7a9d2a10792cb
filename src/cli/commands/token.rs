use anyhow::{Context, Result, bail};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::identity::MAX_LIFETIME_HOURS;

pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_JWT_ISSUER: &str = "jwt-issuer";
pub const ARG_JWT_AUDIENCE: &str = "jwt-audience";
pub const ARG_JWT_EXPIRE_HOURS: &str = "jwt-expire-hours";

#[derive(Debug)]
pub struct Options {
    pub secret: SecretString,
    pub issuer: String,
    pub audience: String,
    pub expire_hours: i64,
}

impl Options {
    /// # Errors
    /// Returns an error if the secret is missing or the lifetime is out of range.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let secret = matches
            .get_one::<String>(ARG_JWT_SECRET)
            .cloned()
            .context("missing required argument: --jwt-secret")?;
        let expire_hours = matches
            .get_one::<i64>(ARG_JWT_EXPIRE_HOURS)
            .copied()
            .unwrap_or(2);
        if !(1..=MAX_LIFETIME_HOURS).contains(&expire_hours) {
            bail!("--{ARG_JWT_EXPIRE_HOURS} must be between 1 and {MAX_LIFETIME_HOURS}");
        }

        Ok(Self {
            secret: SecretString::from(secret),
            issuer: matches
                .get_one::<String>(ARG_JWT_ISSUER)
                .cloned()
                .unwrap_or_else(|| "gatekeeper".to_string()),
            audience: matches
                .get_one::<String>(ARG_JWT_AUDIENCE)
                .cloned()
                .unwrap_or_else(|| "gatekeeper-clients".to_string()),
            expire_hours,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("Symmetric token signing secret (at least 32 bytes)")
                .env("GATEKEEPER_JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_JWT_ISSUER)
                .long(ARG_JWT_ISSUER)
                .help("Issuer claim written into and required from tokens")
                .env("GATEKEEPER_JWT_ISSUER")
                .default_value("gatekeeper"),
        )
        .arg(
            Arg::new(ARG_JWT_AUDIENCE)
                .long(ARG_JWT_AUDIENCE)
                .help("Audience claim written into and required from tokens")
                .env("GATEKEEPER_JWT_AUDIENCE")
                .default_value("gatekeeper-clients"),
        )
        .arg(
            Arg::new(ARG_JWT_EXPIRE_HOURS)
                .long(ARG_JWT_EXPIRE_HOURS)
                .help("Token lifetime in hours")
                .env("GATEKEEPER_JWT_EXPIRE_HOURS")
                .default_value("2")
                .value_parser(clap::value_parser!(i64)),
        )
}
