use crate::auth::TierConfig;
use anyhow::{anyhow, Context};
use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

pub const ARG_RATE_LIMIT_ENABLED: &str = "rate-limit-enabled";
pub const ARG_RATE_LIMIT_MAX: &str = "rate-limit-max";
pub const ARG_RATE_LIMIT_WINDOW: &str = "rate-limit-window-seconds";
pub const ARG_AUTH_RATE_LIMIT_ENABLED: &str = "auth-rate-limit-enabled";
pub const ARG_AUTH_RATE_LIMIT_MAX: &str = "auth-rate-limit-max";
pub const ARG_AUTH_RATE_LIMIT_WINDOW: &str = "auth-rate-limit-window-seconds";
pub const ARG_TRUST_PROXY_HEADERS: &str = "trust-proxy-headers";

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub general: TierConfig,
    pub auth: TierConfig,
    /// Key clients on `X-Forwarded-For`/`X-Real-IP` instead of the peer address.
    pub trust_proxy_headers: bool,
}

fn tier(matches: &ArgMatches, enabled: &str, max: &str, window: &str) -> anyhow::Result<TierConfig> {
    let enabled = matches.get_one::<bool>(enabled).copied().unwrap_or(true);
    let max_requests = matches
        .get_one::<u64>(max)
        .copied()
        .with_context(|| format!("missing required argument: --{max}"))?;
    let window_seconds = matches
        .get_one::<u64>(window)
        .copied()
        .with_context(|| format!("missing required argument: --{window}"))?;

    if enabled && (max_requests == 0 || window_seconds == 0) {
        return Err(anyhow!("--{max} and --{window} must be greater than zero"));
    }

    Ok(TierConfig {
        enabled,
        max: max_requests,
        window: Duration::from_secs(window_seconds),
    })
}

impl Options {
    /// Parse both rate limit tiers from matches.
    ///
    /// # Errors
    /// Returns an error if an enabled tier has a zero budget or window.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        Ok(Self {
            general: tier(
                matches,
                ARG_RATE_LIMIT_ENABLED,
                ARG_RATE_LIMIT_MAX,
                ARG_RATE_LIMIT_WINDOW,
            )?,
            auth: tier(
                matches,
                ARG_AUTH_RATE_LIMIT_ENABLED,
                ARG_AUTH_RATE_LIMIT_MAX,
                ARG_AUTH_RATE_LIMIT_WINDOW,
            )?,
            trust_proxy_headers: matches
                .get_one::<bool>(ARG_TRUST_PROXY_HEADERS)
                .copied()
                .unwrap_or(false),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT_ENABLED)
                .long(ARG_RATE_LIMIT_ENABLED)
                .help("Limit requests to the general API")
                .env("TESSERA_RATE_LIMIT_ENABLED")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_MAX)
                .long(ARG_RATE_LIMIT_MAX)
                .help("Requests allowed per client and window on the general API")
                .env("TESSERA_RATE_LIMIT_MAX")
                .default_value("100")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_WINDOW)
                .long(ARG_RATE_LIMIT_WINDOW)
                .help("General API window length in seconds")
                .env("TESSERA_RATE_LIMIT_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_AUTH_RATE_LIMIT_ENABLED)
                .long(ARG_AUTH_RATE_LIMIT_ENABLED)
                .help("Limit requests to the credential endpoints")
                .env("TESSERA_AUTH_RATE_LIMIT_ENABLED")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_AUTH_RATE_LIMIT_MAX)
                .long(ARG_AUTH_RATE_LIMIT_MAX)
                .help("Requests allowed per client and window on the credential endpoints")
                .env("TESSERA_AUTH_RATE_LIMIT_MAX")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_AUTH_RATE_LIMIT_WINDOW)
                .long(ARG_AUTH_RATE_LIMIT_WINDOW)
                .help("Credential endpoint window length in seconds")
                .env("TESSERA_AUTH_RATE_LIMIT_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_TRUST_PROXY_HEADERS)
                .long(ARG_TRUST_PROXY_HEADERS)
                .help("Take the client address from X-Forwarded-For or X-Real-IP; only enable behind a proxy that sets them")
                .env("TESSERA_TRUST_PROXY_HEADERS")
                .default_value("false")
                .value_parser(clap::value_parser!(bool)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RateLimitTier;

    fn command() -> Command {
        with_args(Command::new("tessera"))
    }

    #[test]
    fn defaults_match_tier_defaults() -> anyhow::Result<()> {
        temp_env::with_vars_unset(
            [
                "TESSERA_AUTH_RATE_LIMIT_MAX",
                "TESSERA_AUTH_RATE_LIMIT_WINDOW_SECONDS",
                "TESSERA_TRUST_PROXY_HEADERS",
            ],
            || {
                let matches = command().get_matches_from(vec!["tessera"]);
                let options = Options::parse(&matches)?;
                assert_eq!(
                    options.general,
                    TierConfig::default_for(RateLimitTier::General)
                );
                assert_eq!(options.auth, TierConfig::default_for(RateLimitTier::Auth));
                assert!(!options.trust_proxy_headers);
                Ok(())
            },
        )
    }

    #[test]
    fn trust_proxy_headers_from_env() -> anyhow::Result<()> {
        temp_env::with_var("TESSERA_TRUST_PROXY_HEADERS", Some("true"), || {
            let matches = command().get_matches_from(vec!["tessera"]);
            Options::parse(&matches).map(|options| assert!(options.trust_proxy_headers))
        })
    }

    #[test]
    fn disabled_tier_accepts_zero() -> anyhow::Result<()> {
        let matches = command().get_matches_from(vec![
            "tessera",
            "--auth-rate-limit-enabled",
            "false",
            "--auth-rate-limit-max",
            "0",
        ]);
        let options = Options::parse(&matches)?;
        assert!(!options.auth.enabled);
        assert!(options.general.enabled);
        Ok(())
    }

    #[test]
    fn enabled_tier_rejects_zero_window() {
        let matches =
            command().get_matches_from(vec!["tessera", "--rate-limit-window-seconds", "0"]);
        assert!(Options::parse(&matches).is_err());
    }

    #[test]
    fn env_overrides() {
        temp_env::with_vars(
            [
                ("TESSERA_AUTH_RATE_LIMIT_MAX", Some("10")),
                ("TESSERA_AUTH_RATE_LIMIT_WINDOW_SECONDS", Some("300")),
            ],
            || {
                let matches = command().get_matches_from(vec!["tessera"]);
                let options = Options::parse(&matches);
                assert!(options.is_ok());
                if let Ok(options) = options {
                    assert_eq!(options.auth.max, 10);
                    assert_eq!(options.auth.window, Duration::from_secs(300));
                }
            },
        );
    }
}
