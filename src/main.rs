use anyhow::Context;
use tether::client::RequestExecutor;
use tether::config::{Config, DemoConfig};
use tether::http::request::Request;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let executor = RequestExecutor::with_tcp(&cfg);

    tokio::select! {
        res = run(&executor, &cfg.demo) => {
            if let Err(e) = &res {
                tracing::error!("Demo failed: {:#}", e);
            }
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let snapshot = executor.monitor().snapshot();
    tracing::info!(
        outstanding = snapshot.outstanding,
        background_workers = snapshot.background_workers,
        connections_opened = snapshot.connections_opened,
        connections_closed = snapshot.connections_closed,
        abandoned = snapshot.handles_abandoned,
        "Final resource accounting"
    );

    executor.shutdown().await?;
    Ok(())
}

/// Issue the configured number of GETs, releasing each response or keeping
/// it unreleased, and report the counters the way the leak shows up.
async fn run(executor: &RequestExecutor, demo: &DemoConfig) -> anyhow::Result<()> {
    let mut held = Vec::new();

    for i in 0..demo.requests {
        let request = Request::get(&demo.url).context("Invalid demo URL")?;
        let response = executor
            .execute(request)
            .await
            .with_context(|| format!("Request {} to {} failed", i + 1, demo.url))?;

        tracing::info!(
            request = i + 1,
            status = response.status().as_u16(),
            connection = ?response.connection_id(),
            "Response received"
        );

        if demo.release {
            let body = response.bytes().await?;
            tracing::debug!(bytes = body.len(), "Body consumed and released");
        } else {
            held.push(response);
        }
    }

    let monitor = executor.monitor();
    tracing::info!(
        outstanding = monitor.outstanding_count(),
        background_workers = monitor.background_worker_count(),
        connections_opened = monitor.connections_opened(),
        held = held.len(),
        "After {} requests",
        demo.requests
    );

    for mut response in held {
        response.release().await?;
    }
    Ok(())
}
