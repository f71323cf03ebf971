/*!
Sentinel kernel entry point.

Boot order: config, store, broker client, kernel wiring, cache warm-up, then
the background loops (bus bridge, agent listener, sweeps, health) and finally
the HTTP server.
*/

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sentinel_kernel::bus::spawn_mqtt_bridge;
use sentinel_kernel::config::KernelConfig;
use sentinel_kernel::connections::{MqttConnections, Presence};
use sentinel_kernel::health::spawn_health_publisher;
use sentinel_kernel::http::{self, AppState};
use sentinel_kernel::mqtt;
use sentinel_kernel::store::{JsonStore, PersistenceGateway};
use sentinel_kernel::Kernel;

const WARM_RETRY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sentinel_kernel=debug")),
        )
        .init();

    let config = KernelConfig::load().await?;
    config.validate()?;

    let gateway: Arc<dyn PersistenceGateway> = match &config.store.path {
        Some(path) => Arc::new(
            JsonStore::open(path.clone())
                .await
                .with_context(|| format!("opening store {}", path.display()))?,
        ),
        None => {
            warn!("no store path configured, state is kept in memory only");
            Arc::new(JsonStore::in_memory())
        }
    };

    let (client, eventloop) = mqtt::create_mqtt_client(&config.mqtt);
    let presence = Presence::default();
    let connections = Arc::new(MqttConnections::new(client.clone(), config.mqtt.topic_prefix.clone(), presence.clone()));
    let kernel = Kernel::build(config, gateway, connections, presence).context("wiring kernel")?;

    // reads fall back to the store until the cache is ready
    {
        let kernel = kernel.clone();
        tokio::spawn(async move {
            loop {
                match kernel.cache.warm(kernel.gateway.as_ref()).await {
                    Ok(count) => {
                        info!(machines = count, "state cache ready");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "cache warm-up failed, retrying");
                        tokio::time::sleep(WARM_RETRY).await;
                    }
                }
            }
        });
    }

    let prefix = kernel.config.mqtt.topic_prefix.clone();
    spawn_mqtt_bridge(&kernel.bus, client.clone(), prefix);
    mqtt::spawn_mqtt_listener(kernel.clone(), client, eventloop);

    let offline_after = Duration::from_secs(kernel.config.agents.offline_after_secs);
    mqtt::spawn_liveness_sweep(kernel.clone(), (offline_after / 3).max(Duration::from_secs(1)), offline_after);
    mqtt::spawn_job_sweep(kernel.clone(), Duration::from_secs(kernel.config.jobs.sweep_interval_secs));
    spawn_health_publisher(kernel.clone());

    let bind = kernel.config.http.bind.clone();
    let app = http::build_router(AppState { kernel });
    let listener = TcpListener::bind(&bind).await.with_context(|| format!("binding {bind}"))?;
    info!("listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}
