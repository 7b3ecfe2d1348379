//! Crypto Gateway Load Generator
//!
//! Drives concurrent HTTP clients against a running gateway instance and
//! reports throughput/latency/error-rate stats. Adapted from this repo's
//! stream-stress binary, but instead of mocking an SSE body locally, each
//! worker issues real requests against the gateway's own REST surface.
//!
//! # Usage
//!
//! ```bash
//! # Basic load test with 50 concurrent clients against a local gateway
//! cargo run --release --bin gateway-loadgen -- --target http://127.0.0.1:8080 --clients 50
//!
//! # Ramp-up test: start with 10, ramp to 200 clients
//! cargo run --release --bin gateway-loadgen -- --ramp-mode --ramp-start 10 --ramp-end 200 --ramp-step 20
//! ```

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio::time;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const ENDPOINTS: &[&str] = &[
    "/fear-greed",
    "/market/listings?limit=20",
    "/market/quotes?symbols=BTC,ETH",
    "/news?limit=10",
    "/whales?limit=10",
    "/overview",
];

#[derive(Debug, Default)]
struct LoadTestResults {
    requests_sent: AtomicU64,
    requests_ok: AtomicU64,
    requests_errored: AtomicU64,
    degraded_responses: AtomicU64,
    total_latency_ms: AtomicU64,
    peak_concurrent: AtomicUsize,
}

impl LoadTestResults {
    fn record_request(&self, latency_ms: u64, ok: bool, degraded: bool) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if ok {
            self.requests_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_errored.fetch_add(1, Ordering::Relaxed);
        }
        if degraded {
            self.degraded_responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn update_peak_concurrent(&self, current: usize) {
        let peak = self.peak_concurrent.load(Ordering::Relaxed);
        if current > peak {
            self.peak_concurrent.store(current, Ordering::Relaxed);
        }
    }

    fn throughput(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.requests_sent.load(Ordering::Relaxed) as f64 / secs
        } else {
            0.0
        }
    }

    fn avg_latency_ms(&self) -> f64 {
        let sent = self.requests_sent.load(Ordering::Relaxed);
        if sent > 0 {
            self.total_latency_ms.load(Ordering::Relaxed) as f64 / sent as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, ClapParser)]
#[command(name = "gateway-loadgen")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the running gateway, e.g. http://127.0.0.1:8080.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    target: String,

    /// Number of concurrent clients to simulate.
    #[arg(short, long, default_value = "50")]
    clients: usize,

    /// Duration of the load test (e.g., "30s", "5m").
    #[arg(short, long, default_value = "30s")]
    duration: humantime::Duration,

    /// Delay between a client's requests, in milliseconds.
    #[arg(long, default_value = "200")]
    request_delay_ms: u64,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Enable ramp-up test mode.
    #[arg(long)]
    ramp_mode: bool,

    /// Starting number of clients for ramp-up.
    #[arg(long, requires = "ramp_mode")]
    ramp_start: Option<usize>,

    /// Ending number of clients for ramp-up.
    #[arg(long, requires = "ramp_mode")]
    ramp_end: Option<usize>,

    /// Step size for ramp-up.
    #[arg(long, requires = "ramp_mode")]
    ramp_step: Option<usize>,

    /// Wait time between ramp steps in seconds.
    #[arg(long, default_value = "10", requires = "ramp_mode")]
    ramp_wait: u64,
}

/// Simulates one polling client: picks the next endpoint in rotation each
/// tick, issues a GET, and records latency/outcome until `deadline`.
async fn simulate_client(
    id: usize,
    client: reqwest::Client,
    base_url: String,
    results: Arc<LoadTestResults>,
    request_delay_ms: u64,
    deadline: Instant,
) {
    let mut tick: usize = 0;
    while Instant::now() < deadline {
        let endpoint = ENDPOINTS[(id + tick) % ENDPOINTS.len()];
        let url = format!("{}{}", base_url, endpoint);
        let start = Instant::now();

        let outcome = client.get(&url).send().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(resp) => {
                let status_ok = resp.status().is_success();
                let degraded = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("degraded").and_then(|d| d.as_bool()))
                    .unwrap_or(false);
                results.record_request(latency_ms, status_ok, degraded);
            }
            Err(_) => {
                results.record_request(latency_ms, false, false);
            }
        }

        tick += 1;
        if request_delay_ms > 0 {
            time::sleep(Duration::from_millis(request_delay_ms)).await;
        }
    }
}

async fn run_load_phase(
    num_clients: usize,
    duration: Duration,
    base_url: String,
    results: Arc<LoadTestResults>,
    request_delay_ms: u64,
) -> Result<()> {
    info!("Starting load phase with {} concurrent clients for {:?}", num_clients, duration);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building load generator HTTP client")?;

    let barrier = Arc::new(Barrier::new(num_clients));
    let deadline = Instant::now() + duration;
    let mut handles = Vec::with_capacity(num_clients);

    for i in 0..num_clients {
        let barrier = Arc::clone(&barrier);
        let client = client.clone();
        let base_url = base_url.clone();
        let results = Arc::clone(&results);

        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            simulate_client(i, client, base_url, results, request_delay_ms, deadline).await;
        }));
    }

    let mut peak_check = time::interval(Duration::from_millis(200));
    loop {
        peak_check.tick().await;
        results.update_peak_concurrent(num_clients);
        if Instant::now() >= deadline {
            break;
        }
    }

    let join_deadline = Instant::now() + Duration::from_secs(30);
    for handle in handles {
        let remaining = join_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Err(e) = tokio::time::timeout(remaining, handle).await {
            warn!("client task timed out: {:?}", e);
        }
    }

    Ok(())
}

fn print_results(results: &LoadTestResults, elapsed: Duration) {
    let sent = results.requests_sent.load(Ordering::Relaxed);
    let ok = results.requests_ok.load(Ordering::Relaxed);
    let errored = results.requests_errored.load(Ordering::Relaxed);
    let degraded = results.degraded_responses.load(Ordering::Relaxed);
    let peak = results.peak_concurrent.load(Ordering::Relaxed);

    println!("\n{:=^60}", " LOAD TEST RESULTS ");
    println!("Duration:               {:?}", elapsed);
    println!("Requests Sent:          {}", sent);
    println!("Requests OK:            {}", ok);
    println!("Requests Errored:       {}", errored);
    println!("Degraded Responses:     {}", degraded);
    println!("Success Rate:           {:.2}%", if sent > 0 { (ok as f64 / sent as f64) * 100.0 } else { 0.0 });
    println!("Peak Concurrent:        {}", peak);
    println!("Throughput:             {:.2} req/sec", results.throughput(elapsed));
    println!("Avg Latency:            {:.2} ms", results.avg_latency_ms());
    println!("{:=^60}\n", "");
}

async fn run_ramp_test(
    start: usize,
    end: usize,
    step: usize,
    step_wait: Duration,
    phase_duration: Duration,
    base_url: String,
    request_delay_ms: u64,
) -> Result<()> {
    let results = Arc::new(LoadTestResults::default());
    let start_time = Instant::now();

    let mut current = start;
    while current <= end {
        info!("Ramp step: {} clients", current);
        run_load_phase(current, phase_duration, base_url.clone(), Arc::clone(&results), request_delay_ms).await?;
        if current + step <= end {
            time::sleep(step_wait).await;
        }
        current += step;
    }

    print_results(&results, start_time.elapsed());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    info!("Crypto gateway load test against {}", args.target);
    let duration = Duration::from(args.duration);

    if args.ramp_mode {
        let start = args.ramp_start.unwrap_or(10);
        let end = args.ramp_end.unwrap_or(100);
        let step = args.ramp_step.unwrap_or(10);
        info!("Running ramp-up test: {} -> {} clients (step {})", start, end, step);
        run_ramp_test(
            start,
            end,
            step,
            Duration::from_secs(args.ramp_wait),
            duration,
            args.target.clone(),
            args.request_delay_ms,
        )
        .await?;
    } else {
        let results = Arc::new(LoadTestResults::default());
        let start_time = Instant::now();
        run_load_phase(args.clients, duration, args.target.clone(), Arc::clone(&results), args.request_delay_ms)
            .await?;
        print_results(&results, start_time.elapsed());
    }

    info!("Load test completed successfully");
    Ok(())
}
