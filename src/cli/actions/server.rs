use crate::{
    api::{
        self,
        users::{MemoryUserStore, PgUserStore, UserStore},
        ApiState,
    },
    auth::{
        AuthGate, PasswordHasher, PasswordParams, RateLimitTier, RateLimiter, RevocationPolicy,
        TierConfig, TokenIssuer, TokenValidityStore,
    },
    cli::commands::store::redact_url,
    store::{KvStore, MemoryStore, RedisStore},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub redis_url: Option<String>,
    pub namespace: String,
    pub rate_limit_shared: bool,
    pub access_secret: SecretString,
    pub refresh_secret: SecretString,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub issuer: String,
    pub token_cache: bool,
    pub revocation_policy: RevocationPolicy,
    pub argon2: PasswordParams,
    pub general_limit: TierConfig,
    pub auth_limit: TierConfig,
    pub trust_proxy_headers: bool,
}

async fn token_store(redis_url: Option<&str>) -> Result<Arc<dyn KvStore>> {
    match redis_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .with_context(|| format!("Failed to connect to redis at {}", redact_url(url)))?;
            info!(url = %redact_url(url), "Connected to redis");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No redis url configured: token cache and revocation list are local to this process");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn user_store(dsn: Option<&str>) -> Result<Arc<dyn UserStore>> {
    match dsn {
        Some(dsn) => {
            let store = PgUserStore::connect(dsn)
                .await
                .context("Failed to connect to database")?;
            info!(dsn = %redact_url(dsn), "Connected to database");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No dsn configured: users are kept in memory and lost on restart");
            Ok(Arc::new(MemoryUserStore::new()))
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if a store cannot be reached, the secrets are unusable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!("Server args: {:?}", args);

    let store = token_store(args.redis_url.as_deref()).await?;
    let users = user_store(args.dsn.as_deref()).await?;

    let issuer = TokenIssuer::new(args.issuer, args.access_secret, args.refresh_secret)
        .context("Invalid token secrets")?
        .with_access_ttl(args.access_ttl)
        .with_refresh_ttl(args.refresh_ttl);

    let validity = if args.token_cache {
        TokenValidityStore::new(store.clone(), args.namespace.as_str())
            .with_policy(args.revocation_policy)
    } else {
        warn!("Token cache disabled: logout cannot revoke tokens");
        TokenValidityStore::disabled()
    };

    let hasher = PasswordHasher::new(args.argon2).context("Invalid argon2 parameters")?;

    let mut limiter = RateLimiter::new(args.namespace.as_str())
        .with_tier(RateLimitTier::General, args.general_limit)
        .with_tier(RateLimitTier::Auth, args.auth_limit);
    if args.rate_limit_shared {
        limiter = limiter.with_shared(store.clone());
    }

    info!(
        port = args.port,
        store = store.backend(),
        users = users.backend(),
        token_cache = args.token_cache,
        revocation_policy = %args.revocation_policy,
        rate_limiter = ?limiter.backend(),
        trust_proxy_headers = args.trust_proxy_headers,
        "Starting tessera"
    );

    let state = ApiState::new(
        AuthGate::new(Arc::new(issuer), validity),
        hasher,
        users,
        limiter,
        store,
    )
    .context("Failed to initialize API state")?
    .with_trust_proxy_headers(args.trust_proxy_headers);

    api::serve(args.port, Arc::new(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_stores_without_urls() -> Result<()> {
        let store = token_store(None).await?;
        assert_eq!(store.backend(), "memory");
        let users = user_store(None).await?;
        assert_eq!(users.backend(), "memory");
        Ok(())
    }

    #[test]
    fn args_debug_hides_secrets() {
        let args = Args {
            port: 8080,
            dsn: None,
            redis_url: None,
            namespace: "tessera".to_string(),
            rate_limit_shared: false,
            access_secret: SecretString::from("top-secret-access".to_string()),
            refresh_secret: SecretString::from("top-secret-refresh".to_string()),
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(604_800),
            issuer: "tessera".to_string(),
            token_cache: true,
            revocation_policy: RevocationPolicy::FailOpen,
            argon2: PasswordParams::default(),
            general_limit: TierConfig::default_for(RateLimitTier::General),
            auth_limit: TierConfig::default_for(RateLimitTier::Auth),
            trust_proxy_headers: false,
        };
        let debug = format!("{args:?}");
        assert!(!debug.contains("top-secret"));
    }
}
