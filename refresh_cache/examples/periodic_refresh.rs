use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use refresh_cache::{
    fallback::FallbackSource, jitter, sources, AccessToken, BearerToken, Expiring, RefreshCache,
    RefreshConfig, Staleness,
};
use refresh_clock::{Clock, System};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The lifetime of tokens issued by the simulated authority, in seconds
    #[arg(short, long, env, default_value_t = 30)]
    lifetime: u64,

    /// Time before expiration at which a token is no longer handed out, in seconds
    #[arg(short, long, env, default_value_t = 5)]
    stale: u64,

    /// Time before expiration at which a token is refreshed in the background, in seconds
    #[arg(short, long, env, default_value_t = 15)]
    prefetch: u64,

    /// Makes every Nth token request to the simulated authority fail
    #[arg(short, long, env)]
    fail_every: Option<u64>,

    /// The maximum amount by which background refreshes are moved earlier, in seconds
    #[arg(short = 'j', long, env, default_value_t = 2)]
    max_jitter: u64,

    /// How often to pull a token from the cache, in seconds
    #[arg(short, long, env, default_value_t = 3)]
    interval: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("token request {0} rejected by the authority")]
struct Rejected(u64);

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = RefreshConfig::builder()
        .stale_duration(Duration::from_secs(opts.stale))
        .prefetch_duration(Duration::from_secs(opts.prefetch))
        .async_refresh_enabled(true)
        .build()?;

    let issued = Arc::new(AtomicU64::new(0));
    let lifetime = Duration::from_secs(opts.lifetime);
    let fail_every = opts.fail_every;
    let authority = sources::from_fn(move || {
        let issued = Arc::clone(&issued);
        async move {
            let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
            if fail_every.map_or(false, |every| n % every == 0) {
                return Err(Rejected(n));
            }

            Ok(BearerToken::expires_in(
                AccessToken::new(format!("simulated-token-{n}")),
                lifetime,
                &System,
            ))
        }
    });

    // Stands in for a token previously saved to disk
    let saved = sources::from_fn(|| async {
        Ok::<_, Rejected>(BearerToken::expires_in(
            AccessToken::from_static("saved-token"),
            Duration::from_secs(60),
            &System,
        ))
    });

    let cache = RefreshCache::builder(authority)
        .config(config)
        .exception_handler(FallbackSource::new("saved", saved))
        .jitter(jitter::RandomEarlyJitter::new(Duration::from_secs(
            opts.max_jitter,
        )))
        .build();

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        let token = match cache.refresh_if_stale_and_fetch().await {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(error = (&error as &dyn std::error::Error), "no token available");
                continue;
            }
        };

        let remaining = token
            .expiration()
            .map(|expiration| expiration.saturating_duration_since(System.now()).as_secs());
        let status = cache.staleness();
        match status {
            Staleness::Fresh => {
                tracing::debug!(
                    ?status,
                    remaining,
                    token = format_args!("{:#?}", token.token()),
                    "pulled token"
                )
            }
            Staleness::PrefetchEligible => {
                tracing::info!(
                    ?status,
                    remaining,
                    token = format_args!("{:#?}", token.token()),
                    "pulled token"
                )
            }
            Staleness::Stale => {
                tracing::warn!(
                    ?status,
                    remaining,
                    token = format_args!("{:#?}", token.token()),
                    "pulled token"
                )
            }
        }
    }
}
