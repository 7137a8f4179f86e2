mod config;
mod jobs;
mod logging;
mod tls;

use clap::Parser;
use config::Args;
use joblib::runtime::DockerRuntime;
use joblib::{ClaimLoop, Executor, JobStore, MemoryStore, Reaper, ReaperHandle};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config()?;
    logging::init(config.log_json);

    if let Some(material) = &config.docker.tls {
        tls::validate(material)?;
        tracing::info!("docker TLS material validated");
    }
    let runtime = DockerRuntime::connect(&config.docker)?;
    runtime.ping().await?;
    tracing::info!(host = ?config.docker.host, "connected to docker");

    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let submitted = match &config.jobs {
        Some(path) => {
            let jobs = jobs::load(path)?;
            jobs::submit(store.as_ref(), jobs, &config.account).await?
        }
        None => Vec::new(),
    };

    let executor = Executor::new(store.clone(), Arc::new(runtime), config.executor.clone());
    let claimer = ClaimLoop::spawn(store.clone(), executor, config.claim.clone());
    let reaper = ReaperHandle::spawn(Reaper::new(store.clone(), config.reaper.clone()));

    let report = if config.once {
        tokio::select! {
            finished = jobs::wait_for_terminal(store.as_ref(), &submitted, config.claim.poll_interval) => Some(finished?),
            _ = tokio::signal::ctrl_c() => None,
        }
    } else {
        tokio::signal::ctrl_c().await?;
        None
    };

    match claimer.stop().await {
        Ok(0) => {}
        Ok(in_flight) => tracing::warn!(in_flight, "exiting with executions still running"),
        Err(err) => tracing::error!(error = %err, "unable to stop the claim loop"),
    }
    reaper.stop().await;

    if let Some(finished) = report {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    }
    Ok(())
}
