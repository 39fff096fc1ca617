//! # Converge - reconciliation host
//!
//! Loads a manifest, wires one in-memory cluster per resource kind into a
//! [`ReconciliationLoop`], declares every resource and waits until the loop
//! goes idle.
//!
//! ## Exit codes
//!
//! - `0`: every resource converged
//! - `1`: at least one resource is failed
//! - `2`: the timeout expired first

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod manifest;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use converge_reconciler::{
    Controller, InMemoryCluster, LoopMetrics, Reconciler, ReconciliationLoop, ResourceKey,
    ResourceStatus, ShutdownReport,
};

use crate::cli::{Cli, Commands};
use crate::manifest::Manifest;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    match Cli::parse().command {
        Commands::Run {
            manifest,
            timeout_secs,
            json,
        } => run(&manifest, Duration::from_secs(timeout_secs), json).await,
        Commands::Validate { manifest } => validate(&manifest),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load(path: &Path) -> Result<Manifest> {
    Manifest::from_file(path).with_context(|| format!("Invalid manifest {}", path.display()))
}

fn validate(path: &Path) -> Result<ExitCode> {
    let manifest = load(path)?;
    let children: usize = manifest.resources.iter().map(|r| r.desired().len()).sum();

    println!(
        "{}: {} resource(s), {} child(ren), {} fault(s), kinds: {}",
        path.display(),
        manifest.resources.len(),
        children,
        manifest.faults.len(),
        manifest.kinds().into_iter().collect::<Vec<_>>().join(", ")
    );
    Ok(ExitCode::SUCCESS)
}

/// How waiting for the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Ending {
    Settled,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Serialize)]
struct Report {
    ending: Ending,
    elapsed_ms: u128,
    resources: Vec<ResourceReport>,
    metrics: LoopMetrics,
    shutdown: ShutdownReport,
}

#[derive(Debug, Serialize)]
struct ResourceReport {
    key: ResourceKey,
    #[serde(flatten)]
    status: ResourceStatus,
}

impl Report {
    fn any_failed(&self) -> bool {
        self.resources.iter().any(|r| r.status.is_failed())
    }

    fn exit_code(&self) -> ExitCode {
        if self.any_failed() {
            ExitCode::from(1)
        } else if self.ending == Ending::Settled {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(2)
        }
    }

    fn print_text(&self) {
        for resource in &self.resources {
            let status = &resource.status;
            let generation = status
                .observed_generation
                .map_or_else(|| "-".to_string(), |g| g.to_string());
            match &status.last_error {
                Some(error) => println!(
                    "{:<40} {:<8} generation={generation} error={error}",
                    resource.key.to_string(),
                    status.phase.to_string()
                ),
                None => println!(
                    "{:<40} {:<8} generation={generation}",
                    resource.key.to_string(),
                    status.phase.to_string()
                ),
            }
        }
        println!(
            "{:?} after {}ms: {} cycle(s), {} converged, {} requeued, {} failed",
            self.ending,
            self.elapsed_ms,
            self.metrics.cycles,
            self.metrics.converged,
            self.metrics.requeued,
            self.metrics.failed
        );
        if self.shutdown != ShutdownReport::default() {
            println!(
                "shutdown stopped waiting for {} worker(s), left {} pending item(s)",
                self.shutdown.abandoned_workers, self.shutdown.pending_items
            );
        }
    }
}

async fn build_loop(manifest: &Manifest) -> Result<Arc<ReconciliationLoop>> {
    let mut builder = Reconciler::builder().with_config(manifest.engine.clone());
    for kind in manifest.kinds() {
        let cluster = InMemoryCluster::new(kind);
        for fault in manifest.faults_for(kind) {
            cluster.inject(fault.clone()).await;
        }
        builder = builder.with_controller(Arc::new(cluster) as Arc<dyn Controller>);
    }
    let reconciler = builder.build().context("Failed to build reconciler")?;
    Ok(ReconciliationLoop::new_arc(Arc::new(reconciler)))
}

async fn wait_until_idle(control: &ReconciliationLoop, timeout: Duration) -> Ending {
    let settle = async {
        // Let the workers pick up the first items before checking idleness.
        tokio::time::sleep(POLL_INTERVAL).await;
        while !control.is_idle() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    tokio::select! {
        () = settle => Ending::Settled,
        () = tokio::time::sleep(timeout) => Ending::TimedOut,
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
            Ending::Interrupted
        }
    }
}

async fn run(path: &Path, timeout: Duration, json: bool) -> Result<ExitCode> {
    let started = Instant::now();
    let manifest = load(path)?;
    let control = build_loop(&manifest).await?;
    let runner = tokio::spawn(Arc::clone(&control).run());

    for resource in &manifest.resources {
        let key = resource.key();
        control
            .declare(&key, resource.desired())
            .await
            .with_context(|| format!("Failed to declare {key}"))?;
    }
    info!(
        resources = manifest.resources.len(),
        workers = manifest.engine.workers,
        "Declared manifest resources"
    );

    let ending = wait_until_idle(&control, timeout).await;
    if ending != Ending::Settled {
        warn!(?ending, "Stopping before every resource settled");
    }

    control.stop();
    let shutdown = runner
        .await
        .context("Reconciliation loop task failed")?
        .context("Reconciliation loop shut down with an error")?;

    let report = Report {
        ending,
        elapsed_ms: started.elapsed().as_millis(),
        resources: control
            .statuses()
            .await
            .into_iter()
            .map(|(key, status)| ResourceReport { key, status })
            .collect(),
        metrics: control.metrics(),
        shutdown,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        report.print_text();
    }
    Ok(report.exit_code())
}
