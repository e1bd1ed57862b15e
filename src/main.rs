// src/main.rs
//! Drives a synthetic upstream workload through the cache and the
//! concurrency gate, reporting metrics as it goes.

use anyhow::Context as _;
use async_trait::async_trait;
use clap::Parser;
use futures::future::join_all;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use upstream_shield::{
    cache::{generate_key, CacheManager, Upstream},
    concurrency::ConcurrencyManager,
    config::load_config,
    context::Context,
    utils::{parse_level, setup_logging, Stopwatch},
};

#[derive(Parser, Debug)]
#[command(name = "shield-demo", about = "Run a synthetic upstream workload through the cache")]
struct Args {
    /// Number of distinct upstream queries
    #[arg(long, default_value_t = 50)]
    keys: usize,

    /// Total requests to issue
    #[arg(long, default_value_t = 500)]
    requests: usize,

    /// Simulated upstream latency per call
    #[arg(long, default_value_t = 20)]
    upstream_latency_ms: u64,

    /// How often to log a metrics snapshot
    #[arg(long, default_value_t = 500)]
    report_interval_ms: u64,
}

/// Fake search backend: slow, and fails now and then
struct SyntheticSearch {
    latency: Duration,
    calls: AtomicU64,
}

#[async_trait]
impl Upstream<String> for SyntheticSearch {
    fn kind(&self) -> &str {
        "search"
    }

    async fn fetch(&self, ctx: Context, params: &HashMap<String, String>) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        ctx.run(tokio::time::sleep(self.latency)).await?;
        if fastrand::u8(..100) < 3 {
            anyhow::bail!("upstream returned 503");
        }
        let query = params.get("q").map(String::as_str).unwrap_or_default();
        Ok(format!("{{\"query\":\"{}\",\"hits\":{}}}", query, fastrand::u32(..1000)))
    }
}

fn query(n: usize) -> HashMap<String, String> {
    HashMap::from([("q".to_string(), format!("item-{n}"))])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config().context("invalid configuration")?;
    setup_logging(parse_level(&config.log_level)).context("failed to initialize logging")?;
    info!("🚀 shield-demo starting: {:?}", args);

    let cache = Arc::new(CacheManager::<String>::new(config.cache.clone()).await?);
    let gate = Arc::new(ConcurrencyManager::new(config.concurrency.clone())?);
    let upstream = Arc::new(SyntheticSearch {
        latency: Duration::from_millis(args.upstream_latency_ms),
        calls: AtomicU64::new(0),
    });
    let keys = args.keys.max(1);

    let run = Context::background();
    let reporter = cache.metrics().start_periodic_reporting(
        run.child(),
        Duration::from_millis(args.report_interval_ms.max(1)),
        |snapshot| {
            let get = &snapshot.latency[&upstream_shield::monitoring::Operation::Get];
            info!(
                "📊 {} | get p50 {:?} p99 {:?} | {} bytes",
                snapshot.basic.summary(),
                get.p50,
                get.p99,
                snapshot.memory.current_bytes
            );
        },
    );

    let mut watch = Stopwatch::start("synthetic workload");

    // Pre-seed a handful of queries so the first requests already hit.
    let seed = (0..keys.min(5)).map(|n| {
        let key = generate_key(upstream.kind(), &query(n), &[]);
        (key, format!("{{\"query\":\"item-{n}\",\"hits\":0}}"))
    });
    match cache.warmup(&run, seed).await {
        Ok(n) => info!("Warmed {} entries", n),
        Err(e) => warn!("Warmup incomplete: {}", e),
    }
    watch.checkpoint("warmup");

    // Background prefetches go through the worker pool.
    for n in (0..keys).step_by(10) {
        let cache = Arc::clone(&cache);
        let upstream = Arc::clone(&upstream);
        let ctx = run.child();
        let submitted = gate.submit_to_worker_pool(async move {
            cache.get_or_fetch(&ctx, upstream, query(n)).await?;
            anyhow::Ok(())
        });
        if let Err(e) = submitted {
            warn!("Prefetch for item-{} not queued: {}", n, e);
        }
    }

    let requests = (0..args.requests).map(|_| {
        let cache = Arc::clone(&cache);
        let gate = Arc::clone(&gate);
        let upstream = Arc::clone(&upstream);
        let ctx = run.child_with_timeout(Duration::from_secs(5));
        let n = fastrand::usize(..keys);
        tokio::spawn(async move {
            gate.execute_with_limits(&ctx, || cache.get_or_fetch(&ctx, upstream, query(n)))
                .await
        })
    });
    let outcomes = join_all(requests).await;
    watch.checkpoint("requests");

    let mut failures: HashMap<&'static str, usize> = HashMap::new();
    for outcome in outcomes {
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => *failures.entry(e.categorize().as_str()).or_default() += 1,
            Err(e) => error!("Request task failed: {}", e),
        }
    }

    run.cancel();
    if let Err(e) = reporter.await {
        warn!("Metrics reporter ended abnormally: {}", e);
    }
    watch.finish();

    let stats = cache.stats();
    info!("{}", stats.metrics.summary());
    info!(
        "Upstream calls: {} for {} requests ({} coalesced)",
        upstream.calls.load(Ordering::Relaxed),
        args.requests,
        stats.coalesced_requests
    );
    if !failures.is_empty() {
        warn!("Failures by category: {:?}", failures);
    }
    info!(
        "Concurrency stats: {}",
        serde_json::to_string_pretty(&gate.stats()).unwrap_or_default()
    );

    let health = cache.health();
    info!("Health: {}", health.summary);

    gate.close().await?;
    cache.close().await?;
    Ok(())
}
