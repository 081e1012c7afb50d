use anyhow::{anyhow, Context};
use clap::{Arg, ArgMatches, Command};
use url::Url;

pub const ARG_DSN: &str = "dsn";
pub const ARG_REDIS_URL: &str = "redis-url";
pub const ARG_STORE_NAMESPACE: &str = "store-namespace";
pub const ARG_RATE_LIMIT_SHARED: &str = "rate-limit-shared";

#[derive(Debug, Clone)]
pub struct Options {
    pub dsn: Option<String>,
    pub redis_url: Option<String>,
    pub namespace: String,
    pub rate_limit_shared: bool,
}

fn read_url(matches: &ArgMatches, id: &str, schemes: &[&str]) -> anyhow::Result<Option<String>> {
    let Some(raw) = matches
        .get_one::<String>(id)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
    else {
        return Ok(None);
    };

    let url = Url::parse(raw).with_context(|| format!("invalid --{id}"))?;
    if !schemes.contains(&url.scheme()) {
        return Err(anyhow!(
            "invalid --{id}: scheme must be one of {}",
            schemes.join(", ")
        ));
    }
    Ok(Some(raw.to_string()))
}

impl Options {
    /// Parse storage arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a URL does not parse or the namespace is blank.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let namespace = matches
            .get_one::<String>(ARG_STORE_NAMESPACE)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("--{ARG_STORE_NAMESPACE} must not be empty"))?;

        Ok(Self {
            dsn: read_url(matches, ARG_DSN, &["postgres", "postgresql"])?,
            redis_url: read_url(matches, ARG_REDIS_URL, &["redis", "rediss", "redis+unix", "unix"])?,
            namespace,
            rate_limit_shared: matches
                .get_one::<bool>(ARG_RATE_LIMIT_SHARED)
                .copied()
                .unwrap_or(false),
        })
    }
}

/// Render a connection URL for logs with the password removed.
#[must_use]
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                // set_password only fails for URLs that cannot carry credentials
                let _ = url.set_password(Some("*****"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("PostgreSQL connection string for user records")
                .long_help(
                    "PostgreSQL connection string for user records. Users are kept in memory when not set.",
                )
                .env("TESSERA_DSN"),
        )
        .arg(
            Arg::new(ARG_REDIS_URL)
                .long(ARG_REDIS_URL)
                .help("Redis URL for the token cache, revocation list and shared rate limits")
                .long_help(
                    "Redis URL for the token cache, revocation list and shared rate limits. An in-process store is used when not set, which only works for a single instance.",
                )
                .env("TESSERA_REDIS_URL"),
        )
        .arg(
            Arg::new(ARG_STORE_NAMESPACE)
                .long(ARG_STORE_NAMESPACE)
                .help("Prefix for every key written to the store")
                .env("TESSERA_STORE_NAMESPACE")
                .default_value("tessera"),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_SHARED)
                .long(ARG_RATE_LIMIT_SHARED)
                .help("Keep rate limit counters in Redis so all instances share them")
                .env("TESSERA_RATE_LIMIT_SHARED")
                .default_value("false")
                .value_parser(clap::value_parser!(bool)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        with_args(Command::new("tessera"))
    }

    #[test]
    fn defaults_to_in_process_stores() -> anyhow::Result<()> {
        temp_env::with_vars(
            [
                ("TESSERA_DSN", None::<&str>),
                ("TESSERA_REDIS_URL", None::<&str>),
            ],
            || -> anyhow::Result<()> {
                let matches = command().get_matches_from(vec!["tessera"]);
                let options = Options::parse(&matches)?;
                assert_eq!(options.dsn, None);
                assert_eq!(options.redis_url, None);
                assert_eq!(options.namespace, "tessera");
                assert!(!options.rate_limit_shared);
                Ok(())
            },
        )
    }

    #[test]
    fn urls_are_checked() {
        let matches = command().get_matches_from(vec!["tessera", "--redis-url", "http://cache:6379"]);
        assert!(Options::parse(&matches).is_err());

        let matches = command().get_matches_from(vec!["tessera", "--dsn", "not a url"]);
        assert!(Options::parse(&matches).is_err());
    }

    #[test]
    fn redis_and_shared_counters() -> anyhow::Result<()> {
        let matches = command().get_matches_from(vec![
            "tessera",
            "--redis-url",
            "redis://cache:6379/0",
            "--rate-limit-shared",
            "true",
            "--store-namespace",
            "edge",
        ]);
        let options = Options::parse(&matches)?;
        assert_eq!(options.redis_url.as_deref(), Some("redis://cache:6379/0"));
        assert!(options.rate_limit_shared);
        assert_eq!(options.namespace, "edge");
        Ok(())
    }

    #[test]
    fn redact_url_hides_password() {
        assert_eq!(
            redact_url("postgres://tessera:hunter2@db:5432/tessera"),
            "postgres://tessera:*****@db:5432/tessera"
        );
        assert_eq!(redact_url("redis://cache:6379"), "redis://cache:6379");
        assert_eq!(redact_url("nope"), "<invalid url>");
    }
}
