use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_LOCKOUT_MAX_ATTEMPTS: &str = "lockout-max-attempts";
pub const ARG_LOCKOUT_MINUTES: &str = "lockout-minutes";
pub const ARG_PASSWORD_MIN_LENGTH: &str = "password-min-length";
pub const ARG_USERNAME_MIN_LENGTH: &str = "username-min-length";
pub const ARG_REQUIRE_CONFIRMED_EMAIL: &str = "require-confirmed-email";
pub const ARG_ADMIN_ROLE: &str = "admin-role";
pub const ARG_SEED_ROLES: &str = "seed-roles";

#[derive(Debug)]
pub struct Options {
    pub lockout_max_attempts: u32,
    pub lockout_minutes: i64,
    pub password_min_length: usize,
    pub username_min_length: usize,
    pub require_confirmed_email: bool,
    pub admin_role: String,
    pub seed_roles: Vec<String>,
}

impl Options {
    /// # Errors
    /// Currently infallible; kept fallible like the other option groups.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            lockout_max_attempts: matches
                .get_one::<u32>(ARG_LOCKOUT_MAX_ATTEMPTS)
                .copied()
                .unwrap_or(5),
            lockout_minutes: matches
                .get_one::<i64>(ARG_LOCKOUT_MINUTES)
                .copied()
                .unwrap_or(5),
            password_min_length: matches
                .get_one::<usize>(ARG_PASSWORD_MIN_LENGTH)
                .copied()
                .unwrap_or(6),
            username_min_length: matches
                .get_one::<usize>(ARG_USERNAME_MIN_LENGTH)
                .copied()
                .unwrap_or(3),
            require_confirmed_email: matches.get_flag(ARG_REQUIRE_CONFIRMED_EMAIL),
            admin_role: matches
                .get_one::<String>(ARG_ADMIN_ROLE)
                .cloned()
                .unwrap_or_else(|| "admin".to_string()),
            seed_roles: matches
                .get_many::<String>(ARG_SEED_ROLES)
                .map(|roles| {
                    roles
                        .map(|role| role.trim().to_string())
                        .filter(|role| !role.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOCKOUT_MAX_ATTEMPTS)
                .long(ARG_LOCKOUT_MAX_ATTEMPTS)
                .help("Consecutive failed logins before an identity is locked")
                .env("GATEKEEPER_LOCKOUT_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_MINUTES)
                .long(ARG_LOCKOUT_MINUTES)
                .help("Lock duration in minutes")
                .env("GATEKEEPER_LOCKOUT_MINUTES")
                .default_value("5")
                .value_parser(clap::value_parser!(i64).range(0..)),
        )
        .arg(
            Arg::new(ARG_PASSWORD_MIN_LENGTH)
                .long(ARG_PASSWORD_MIN_LENGTH)
                .help("Minimum password length in characters")
                .env("GATEKEEPER_PASSWORD_MIN_LENGTH")
                .default_value("6")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_USERNAME_MIN_LENGTH)
                .long(ARG_USERNAME_MIN_LENGTH)
                .help("Minimum username length in characters")
                .env("GATEKEEPER_USERNAME_MIN_LENGTH")
                .default_value("3")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_REQUIRE_CONFIRMED_EMAIL)
                .long(ARG_REQUIRE_CONFIRMED_EMAIL)
                .help("Refuse sign-in until an admin confirms the email address")
                .env("GATEKEEPER_REQUIRE_CONFIRMED_EMAIL")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_ADMIN_ROLE)
                .long(ARG_ADMIN_ROLE)
                .help("Role that grants access to administrative endpoints")
                .env("GATEKEEPER_ADMIN_ROLE")
                .default_value("admin"),
        )
        .arg(
            Arg::new(ARG_SEED_ROLES)
                .long(ARG_SEED_ROLES)
                .help("Comma-separated roles created at startup if missing")
                .env("GATEKEEPER_SEED_ROLES")
                .value_delimiter(',')
                .default_value("admin,student"),
        )
}
