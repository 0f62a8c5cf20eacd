//! veritas-infra entry point.
//!
//! Builds the infrastructure stack from the environment, keeps it alive
//! until Ctrl-C, logs health periodically and shuts everything down in
//! order.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use veritas_infra::app_state::AppState;
use veritas_infra::audit::{Severity, event_types};
use veritas_infra::config::AppConfig;
use veritas_infra::domain::InfraEvent;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        storage = ?config.database.backend,
        cache = ?config.cache.backend,
        workers = config.workers.max_workers,
        "starting veritas-infra"
    );

    let state = AppState::build(config).await?;
    let lease = state.coordinator.initialize().await.inspect_err(|e| {
        tracing::error!(error = %e, code = e.error_code(), "persistence stack failed to start");
    })?;
    let service = state.verification_service().await?;

    if let Err(e) = state
        .audit
        .log_event(
            event_types::STARTUP,
            None,
            json!({
                "workers": state.config.workers.max_workers,
                "storage": format!("{:?}", state.config.database.backend),
            }),
            Severity::Info,
        )
        .await
    {
        tracing::error!(error = %e, "startup audit event not recorded");
    }

    let stop = CancellationToken::new();

    let mut events = state.events.subscribe();
    let event_log = {
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(InfraEvent::CacheMemoryAlert { usage_percent, .. }) => {
                            tracing::warn!(usage_percent, "cache memory alert");
                        }
                        Ok(event) => tracing::debug!(?event, "infrastructure event"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event log lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    };

    let health_log = {
        let stop = stop.clone();
        let Some(services) = lease.resource() else {
            anyhow::bail!("coordinator lease has no services");
        };
        let workers = state.workers.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let health = services.get_health().await;
                        let stats = workers.stats();
                        if health.status == "healthy" {
                            tracing::info!(
                                status = health.status,
                                connections_in_use = health.database.in_use,
                                cache_hit_rate = health.cache.hit_rate,
                                workers_busy = stats.busy,
                                workers_queued = stats.queued,
                                "health"
                            );
                        } else {
                            tracing::warn!(
                                status = health.status,
                                database = %health.database.detail,
                                cache_reachable = health.cache_reachable,
                                "health degraded"
                            );
                        }
                    }
                }
            }
        })
    };

    tracing::info!("veritas-infra running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    stop.cancel();
    let _ = tokio::join!(event_log, health_log);

    if let Err(e) = state
        .audit
        .log_event(event_types::SHUTDOWN, None, json!({}), Severity::Info)
        .await
    {
        tracing::error!(error = %e, "shutdown audit event not recorded");
    }
    service.shutdown().await;
    state.coordinator.close(lease).await;
    state.workers.close();
    tracing::info!("veritas-infra stopped");
    Ok(())
}
