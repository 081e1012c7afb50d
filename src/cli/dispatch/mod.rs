//! Turn validated CLI matches into the server action.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{auth, rate_limit, store, ARG_PORT};
use anyhow::{anyhow, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);

    let store_opts = store::Options::parse(matches)?;
    let auth_opts = auth::Options::parse(matches)?;
    let rate_limit_opts = rate_limit::Options::parse(matches)?;

    if store_opts.rate_limit_shared && store_opts.redis_url.is_none() {
        return Err(anyhow!(
            "--{} requires --{}",
            store::ARG_RATE_LIMIT_SHARED,
            store::ARG_REDIS_URL
        ));
    }

    Ok(Action::Server(Args {
        port,
        dsn: store_opts.dsn,
        redis_url: store_opts.redis_url,
        namespace: store_opts.namespace,
        rate_limit_shared: store_opts.rate_limit_shared,
        access_secret: auth_opts.access_secret,
        refresh_secret: auth_opts.refresh_secret,
        access_ttl: auth_opts.access_ttl,
        refresh_ttl: auth_opts.refresh_ttl,
        issuer: auth_opts.issuer,
        token_cache: auth_opts.token_cache,
        revocation_policy: auth_opts.revocation_policy,
        argon2: auth_opts.argon2,
        general_limit: rate_limit_opts.general,
        auth_limit: rate_limit_opts.auth,
        trust_proxy_headers: rate_limit_opts.trust_proxy_headers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RevocationPolicy;

    const CLEAR: [(&str, Option<&str>); 4] = [
        ("TESSERA_REDIS_URL", None),
        ("TESSERA_DSN", None),
        ("TESSERA_RATE_LIMIT_SHARED", None),
        ("TESSERA_TRUST_PROXY_HEADERS", None),
    ];

    #[test]
    fn server_action_from_args() {
        temp_env::with_vars(CLEAR, || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "tessera",
                "--access-token-secret",
                "access",
                "--refresh-token-secret",
                "refresh",
                "--revocation-policy",
                "fail-closed",
                "--port",
                "9000",
            ]);
            let result = handler(&matches);
            assert!(result.is_ok());
            if let Ok(Action::Server(args)) = result {
                assert_eq!(args.port, 9000);
                assert_eq!(args.dsn, None);
                assert_eq!(args.redis_url, None);
                assert_eq!(args.namespace, "tessera");
                assert_eq!(args.revocation_policy, RevocationPolicy::FailClosed);
                assert!(args.token_cache);
                assert_eq!(args.auth_limit.max, 5);
                assert_eq!(args.general_limit.max, 100);
                assert!(!args.trust_proxy_headers);
            }
        });
    }

    #[test]
    fn shared_rate_limit_requires_redis() {
        temp_env::with_vars(CLEAR, || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "tessera",
                "--access-token-secret",
                "access",
                "--refresh-token-secret",
                "refresh",
                "--rate-limit-shared",
                "true",
            ]);
            let result = handler(&matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err
                    .to_string()
                    .contains("--rate-limit-shared requires --redis-url"));
            }
        });
    }
}
