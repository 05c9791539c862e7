// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Post Rate Limiter
//!
//! Admission control for news postings. Three modes:
//!
//! 1. **check**: called by the news server filter once per post. Prints
//!    nothing when the post is accepted, or the rejection message when it
//!    is not. Exit status 0 accepted, 1 rate limited, 2 anything else.
//!
//! 2. **serve**: long-running HTTP service answering `POST /check`, with a
//!    background retention sweep.
//!
//! 3. **sweep**: one retention pass over the state directory. An accepted
//!    `check` starts one as a detached child when `SWEEP_ON_ACCEPT` is set;
//!    it can equally be run from cron with `SWEEP_ON_ACCEPT=false`.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `STATE_DIR`: counter directory (default: /news/spam/nnrpd/ratelimit)
//! - `BIND_ADDR`: server bind address (default: 127.0.0.1:8119)
//! - `CONTENT_WINDOW_SECS`: seconds between identical posts (default: 300)
//! - `IDENTITY_WINDOW_SECS`: seconds between posts by one user (default: 60)
//! - `HOURLY_CAP`: accepted posts per user per hour (default: 50)
//! - `CROSS_POST_THRESHOLD`: groups allowed before cross-post limits apply (default: 3)
//! - `CROSS_POST_WINDOW_SECS`: seconds between repeats of a cross-post (default: 1800)
//! - `RETENTION_SECS`: age at which counters are swept (default: 86400)
//! - `LOCK_TIMEOUT_MS`: how long a decision waits for its locks (default: 2000)
//! - `SWEEP_ON_ACCEPT`: start a background sweep after an accepted post (default: true)
//! - `SWEEP_INTERVAL_SECS`: background sweep interval in `serve` mode (default: 300)
//! - `METRICS_ENABLED`: expose `/metrics` in `serve` mode (default: true)

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Command as Process, ExitCode, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use post_rate_limiter::{
    config::Config,
    handlers::{router, AppState},
    limiter::{Decision, RateLimitEngine, SubmissionAttempt},
    metrics::Metrics,
    store::FileCounterStore,
    sweeper::{try_sweep_lock, RetentionSweeper},
};

const EXIT_ALLOWED: u8 = 0;
const EXIT_RATE_LIMITED: u8 = 1;
const EXIT_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "post-rate-limiter", version, about = "Admission control for news postings")]
struct Args {
    /// Counter directory, overrides STATE_DIR
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide on a single submission
    Check {
        /// Authenticated poster
        #[arg(allow_hyphen_values = true)]
        user: String,
        /// Hex HMAC-SHA512 of the post content
        #[arg(allow_hyphen_values = true)]
        hash: String,
        /// Message-ID header
        #[arg(allow_hyphen_values = true)]
        message_id: String,
        /// From header
        #[arg(allow_hyphen_values = true)]
        from: String,
        /// Subject header
        #[arg(allow_hyphen_values = true)]
        subject: String,
        /// Newsgroups header
        #[arg(allow_hyphen_values = true)]
        newsgroups: String,
    },
    /// Run the HTTP service
    Serve {
        /// Bind address, overrides BIND_ADDR
        #[arg(long)]
        bind: Option<String>,
    },
    /// Remove expired counters once
    Sweep,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match &args.command {
        Command::Serve { .. } => init_json_logging(),
        _ => init_stderr_logging(),
    }

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    if let Some(dir) = args.state_dir {
        config.store.state_dir = dir;
    }

    match args.command {
        Command::Check {
            user,
            hash,
            message_id,
            from,
            subject,
            newsgroups,
        } => {
            let attempt = SubmissionAttempt {
                identity: user,
                fingerprint: hash,
                message_id,
                from,
                subject,
                newsgroups,
                arrived_at: chrono::Utc::now().timestamp(),
            };
            run_check(config, attempt).await
        }
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            match run_serve(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = ?e, "Service stopped");
                    ExitCode::from(EXIT_FAILURE)
                }
            }
        }
        Command::Sweep => run_sweep(config).await,
    }
}

/// Compact logs on stderr; stdout is reserved for the rejection message.
fn init_stderr_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::WARN.into())
                .from_env_lossy(),
        )
        .init();
}

fn init_json_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

async fn open_store(config: &Config) -> Option<Arc<FileCounterStore>> {
    match FileCounterStore::open(&config.store).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            error!(
                state_dir = %config.store.state_dir.display(),
                error = %e,
                "Cannot open counter store"
            );
            None
        }
    }
}

async fn run_check(config: Config, attempt: SubmissionAttempt) -> ExitCode {
    let Some(store) = open_store(&config).await else {
        return ExitCode::from(EXIT_FAILURE);
    };

    let engine = RateLimitEngine::new(store.clone(), config.rate_limit.clone())
        .with_lock_timeout(config.store.lock_timeout());

    let decision = engine.decide(&attempt).await;
    match decision {
        Decision::Accept => {
            if config.sweeper.sweep_on_accept {
                spawn_background_sweep(&config.store.state_dir);
            }
            ExitCode::from(EXIT_ALLOWED)
        }
        Decision::Reject(rejection) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = write!(stdout, "{}", rejection.message).and_then(|()| stdout.flush()) {
                warn!(error = %e, "Could not write rejection message");
            }
            if rejection.reason.is_rate_limit() {
                ExitCode::from(EXIT_RATE_LIMITED)
            } else {
                ExitCode::from(EXIT_FAILURE)
            }
        }
    }
}

/// Start a detached `sweep` so the caller gets its exit status without
/// waiting on the retention pass.
fn spawn_background_sweep(state_dir: &Path) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            warn!(error = %e, "Cannot locate own executable for sweep");
            return;
        }
    };
    let spawned = Process::new(exe)
        .arg("--state-dir")
        .arg(state_dir)
        .arg("sweep")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        warn!(error = %e, "Could not start background sweep");
    }
}

async fn run_sweep(config: Config) -> ExitCode {
    let Some(store) = open_store(&config).await else {
        return ExitCode::from(EXIT_FAILURE);
    };

    let _sweep_lock = match try_sweep_lock(&config.store.state_dir) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            info!("Another sweep is running");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!(error = %e, "Cannot take sweep lock");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let sweeper = RetentionSweeper::new(store, config.rate_limit.retention_secs)
        .with_lock_timeout(config.sweeper.lock_timeout());
    match sweeper.sweep(chrono::Utc::now().timestamp()).await {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Retention sweep failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    info!(
        bind_addr = %config.bind_addr,
        state_dir = %config.store.state_dir.display(),
        hourly_cap = config.rate_limit.hourly_cap,
        cross_post_threshold = config.rate_limit.cross_post_threshold,
        "Starting post rate limiter"
    );

    let store = Arc::new(
        FileCounterStore::open(&config.store)
            .await
            .with_context(|| format!("opening {}", config.store.state_dir.display()))?,
    );
    let metrics = Metrics::new().context("registering metrics")?;

    let engine = RateLimitEngine::new(store.clone(), config.rate_limit.clone())
        .with_lock_timeout(config.store.lock_timeout())
        .with_metrics(metrics.clone());
    let sweeper = RetentionSweeper::new(store, config.rate_limit.retention_secs)
        .with_lock_timeout(config.sweeper.lock_timeout())
        .with_metrics(metrics.clone());

    let state = Arc::new(AppState {
        engine,
        sweeper,
        metrics,
        config: config.clone(),
    });

    // Spawn sweep task
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let period = sweep_state.config.sweeper.interval().max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_state
                .sweeper
                .sweep(chrono::Utc::now().timestamp())
                .await
            {
                warn!(error = %e, "Retention sweep failed");
            }
        }
    });

    let app = router(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
