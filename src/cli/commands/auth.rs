use crate::auth::{PasswordParams, RevocationPolicy};
use anyhow::{anyhow, Context};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

pub const ARG_ACCESS_TOKEN_SECRET: &str = "access-token-secret";
pub const ARG_REFRESH_TOKEN_SECRET: &str = "refresh-token-secret";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl-seconds";
pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_TOKEN_CACHE: &str = "token-cache";
pub const ARG_REVOCATION_POLICY: &str = "revocation-policy";
pub const ARG_ARGON2_MEMORY_KIB: &str = "argon2-memory-kib";
pub const ARG_ARGON2_ITERATIONS: &str = "argon2-iterations";
pub const ARG_ARGON2_PARALLELISM: &str = "argon2-parallelism";

#[derive(Debug, Clone)]
pub struct Options {
    pub access_secret: SecretString,
    pub refresh_secret: SecretString,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub issuer: String,
    pub token_cache: bool,
    pub revocation_policy: RevocationPolicy,
    pub argon2: PasswordParams,
}

impl Options {
    /// Parse token and password hashing arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a secret is missing or a value is out of range.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read_secret = |id: &str| -> anyhow::Result<SecretString> {
            matches
                .get_one::<String>(id)
                .filter(|v| !v.trim().is_empty())
                .map(|v| SecretString::from(v.clone()))
                .ok_or_else(|| anyhow!("missing required argument: --{id}"))
        };
        let read_seconds = |id: &str| -> anyhow::Result<Duration> {
            let seconds = matches
                .get_one::<u64>(id)
                .copied()
                .with_context(|| format!("missing required argument: --{id}"))?;
            if seconds == 0 {
                return Err(anyhow!("--{id} must be greater than zero"));
            }
            Ok(Duration::from_secs(seconds))
        };
        let read_u32 = |id: &str| -> anyhow::Result<u32> {
            matches
                .get_one::<u32>(id)
                .copied()
                .with_context(|| format!("missing required argument: --{id}"))
        };

        let revocation_policy = matches
            .get_one::<String>(ARG_REVOCATION_POLICY)
            .map(|policy| policy.parse::<RevocationPolicy>())
            .transpose()
            .map_err(|err| anyhow!(err))?
            .unwrap_or_default();

        Ok(Self {
            access_secret: read_secret(ARG_ACCESS_TOKEN_SECRET)?,
            refresh_secret: read_secret(ARG_REFRESH_TOKEN_SECRET)?,
            access_ttl: read_seconds(ARG_ACCESS_TOKEN_TTL)?,
            refresh_ttl: read_seconds(ARG_REFRESH_TOKEN_TTL)?,
            issuer: matches
                .get_one::<String>(ARG_TOKEN_ISSUER)
                .cloned()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            token_cache: matches
                .get_one::<bool>(ARG_TOKEN_CACHE)
                .copied()
                .unwrap_or(true),
            revocation_policy,
            argon2: PasswordParams {
                memory_kib: read_u32(ARG_ARGON2_MEMORY_KIB)?,
                iterations: read_u32(ARG_ARGON2_ITERATIONS)?,
                parallelism: read_u32(ARG_ARGON2_PARALLELISM)?,
            },
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    with_argon2_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_SECRET)
                .long(ARG_ACCESS_TOKEN_SECRET)
                .help("HMAC secret for access tokens")
                .env("TESSERA_ACCESS_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_SECRET)
                .long(ARG_REFRESH_TOKEN_SECRET)
                .help("HMAC secret for refresh tokens, must differ from the access secret")
                .env("TESSERA_REFRESH_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token lifetime in seconds")
                .env("TESSERA_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token lifetime in seconds")
                .env("TESSERA_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("Value of the `iss` claim")
                .env("TESSERA_TOKEN_ISSUER")
                .default_value("tessera"),
        )
        .arg(
            Arg::new(ARG_TOKEN_CACHE)
                .long(ARG_TOKEN_CACHE)
                .help("Cache validated tokens and keep the revocation list")
                .env("TESSERA_TOKEN_CACHE")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_REVOCATION_POLICY)
                .long(ARG_REVOCATION_POLICY)
                .help("Answer for revocation checks while the store is unreachable")
                .env("TESSERA_REVOCATION_POLICY")
                .default_value("fail-open")
                .value_parser(["fail-open", "fail-closed"]),
        )
}

fn with_argon2_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ARGON2_MEMORY_KIB)
                .long(ARG_ARGON2_MEMORY_KIB)
                .help("Argon2id memory cost in KiB")
                .env("TESSERA_ARGON2_MEMORY_KIB")
                .default_value("65536")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ARGON2_ITERATIONS)
                .long(ARG_ARGON2_ITERATIONS)
                .help("Argon2id time cost")
                .env("TESSERA_ARGON2_ITERATIONS")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ARGON2_PARALLELISM)
                .long(ARG_ARGON2_PARALLELISM)
                .help("Argon2id lanes")
                .env("TESSERA_ARGON2_PARALLELISM")
                .default_value("2")
                .value_parser(clap::value_parser!(u32)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn command() -> Command {
        with_args(Command::new("tessera"))
    }

    #[test]
    fn defaults() -> anyhow::Result<()> {
        let matches = command().get_matches_from(vec![
            "tessera",
            "--access-token-secret",
            "a-secret",
            "--refresh-token-secret",
            "r-secret",
        ]);
        let options = Options::parse(&matches)?;

        assert_eq!(options.access_secret.expose_secret(), "a-secret");
        assert_eq!(options.refresh_secret.expose_secret(), "r-secret");
        assert_eq!(options.access_ttl, Duration::from_secs(900));
        assert_eq!(options.refresh_ttl, Duration::from_secs(604_800));
        assert_eq!(options.issuer, "tessera");
        assert!(options.token_cache);
        assert_eq!(options.revocation_policy, RevocationPolicy::FailOpen);
        assert_eq!(options.argon2, PasswordParams::default());
        Ok(())
    }

    #[test]
    fn overrides() -> anyhow::Result<()> {
        let matches = command().get_matches_from(vec![
            "tessera",
            "--access-token-secret",
            "a-secret",
            "--refresh-token-secret",
            "r-secret",
            "--token-cache",
            "false",
            "--revocation-policy",
            "fail-closed",
            "--access-token-ttl-seconds",
            "60",
            "--argon2-memory-kib",
            "19456",
        ]);
        let options = Options::parse(&matches)?;

        assert!(!options.token_cache);
        assert_eq!(options.revocation_policy, RevocationPolicy::FailClosed);
        assert_eq!(options.access_ttl, Duration::from_secs(60));
        assert_eq!(options.argon2.memory_kib, 19_456);
        Ok(())
    }

    #[test]
    fn zero_ttl_rejected() {
        let matches = command().get_matches_from(vec![
            "tessera",
            "--access-token-secret",
            "a-secret",
            "--refresh-token-secret",
            "r-secret",
            "--refresh-token-ttl-seconds",
            "0",
        ]);
        let result = Options::parse(&matches);
        assert!(result.is_err());
        if let Err(err) = result {
            assert!(err.to_string().contains("refresh-token-ttl-seconds"));
        }
    }

    #[test]
    fn blank_secret_rejected() {
        let matches = command().get_matches_from(vec![
            "tessera",
            "--access-token-secret",
            " ",
            "--refresh-token-secret",
            "r-secret",
        ]);
        let result = Options::parse(&matches);
        assert!(result.is_err());
        if let Err(err) = result {
            assert!(err
                .to_string()
                .contains("missing required argument: --access-token-secret"));
        }
    }

    #[test]
    fn secrets_from_env() {
        temp_env::with_vars(
            [
                ("TESSERA_ACCESS_TOKEN_SECRET", Some("env-access")),
                ("TESSERA_REFRESH_TOKEN_SECRET", Some("env-refresh")),
            ],
            || {
                let matches = command().get_matches_from(vec!["tessera"]);
                let options = Options::parse(&matches);
                assert!(options.is_ok());
                if let Ok(options) = options {
                    assert_eq!(options.access_secret.expose_secret(), "env-access");
                }
            },
        );
    }
}
