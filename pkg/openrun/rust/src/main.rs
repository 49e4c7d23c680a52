// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use openrun_supd::cli::Args;
use openrun_supd::config::load_configs;
use openrun_supd::descriptor::DescriptorStore;
use openrun_supd::proxy::{self, Router};
use openrun_supd::supervisor::Supervisor;
use std::process::ExitCode;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    simple_logger::init_with_level(args.log_level)?;
    info!(
        "openrun-supd starting (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    let configs = if args.config_dir.exists() {
        load_configs(&args.config_dir)?
    } else {
        warn!(
            "config directory {} does not exist, running with no workloads",
            args.config_dir.display()
        );
        Vec::new()
    };
    let store = DescriptorStore::from_configs(configs);
    info!("loaded {} workload descriptor(s)", store.len());

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding router to {}", args.listen))?;
    info!("router listening on {}", listener.local_addr()?);

    let supervisor = Supervisor::new(&store, args.settings());
    let router = Router::new(
        supervisor.routes(),
        supervisor.status(),
        supervisor.events(),
        args.request_timeout(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    let server = tokio::spawn(proxy::serve(
        listener,
        router,
        shutdown_requested(shutdown_rx.clone()),
    ));
    let result = supervisor.run(shutdown_requested(shutdown_rx)).await;
    if let Err(e) = server.await {
        warn!("router task failed: {e}");
    }

    match result {
        Ok(()) => {
            info!("openrun-supd stopped");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("non-clean shutdown: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
