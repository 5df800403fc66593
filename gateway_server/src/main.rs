use plcgate::api::rest::{api_router, ApiState};
use plcgate::api::sse::{register_status_events, SseFanout, SseHub};
use plcgate::config::settings::Settings;
use plcgate::drivers;
use plcgate::logging::init_logging;
use plcgate::plc::manager::{ManagerGateway, PlcManager};
use plcgate::publish::batcher::Publisher;
use plcgate::publish::packs::PackRegistry;
use plcgate::publish::spawn_health_loop;
use plcgate::write::executor::{WriteExecutor, WriteGateway};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let settings = match Settings::load(&config_path) {
        Ok(s) => s,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(
        plcs = settings.plcs.len(),
        path = %config_path.display(),
        "configuration loaded"
    );

    let manager = PlcManager::new(drivers::default_factory());
    for plc in &settings.plcs {
        if let Err(e) = manager.add_plc(plc.clone()).await {
            // a malformed entry is fatal only for that entry
            warn!(plc = %plc.name, error = %e, "skipping plc");
        }
    }
    let plc_names = manager.plc_names().await;

    let gateway: Arc<dyn WriteGateway> = Arc::new(ManagerGateway(Arc::clone(&manager)));
    let transports = CancellationToken::new();
    let mut publishers: Vec<Arc<Publisher>> = Vec::new();

    #[cfg(feature = "mqtt")]
    if let Some(cfg) = &settings.mqtt {
        match plcgate::publish::mqtt::spawn_mqtt(
            cfg,
            &plc_names,
            Arc::clone(&gateway),
            transports.clone(),
        )
        .await
        {
            Ok(publisher) => publishers.push(publisher),
            Err(e) => error!(error = %e, "mqtt transport failed to start"),
        }
    }
    #[cfg(feature = "valkey")]
    if let Some(cfg) = &settings.valkey {
        match plcgate::publish::valkey::spawn_valkey(cfg).await {
            Ok(publisher) => publishers.push(publisher),
            Err(e) => error!(error = %e, "valkey transport failed to start"),
        }
    }
    #[cfg(feature = "kafka")]
    if let Some(cfg) = &settings.kafka {
        match plcgate::publish::kafka::spawn_kafka(
            cfg,
            &plc_names,
            Arc::clone(&gateway),
            transports.clone(),
        )
        .await
        {
            Ok(publisher) => publishers.push(publisher),
            Err(e) => error!(error = %e, "kafka transport failed to start"),
        }
    }

    let hub = SseHub::new();
    for publisher in &publishers {
        manager.on_changes(Arc::clone(publisher) as _);
    }
    manager.on_changes(Arc::new(SseFanout(Arc::clone(&hub))));
    register_status_events(&manager, Arc::clone(&hub));

    if !settings.packs.is_empty() {
        let packs = PackRegistry::new(Arc::clone(&manager), &settings.packs);
        for publisher in &publishers {
            packs.add_publisher(Arc::clone(publisher));
        }
        let pack_hub = Arc::clone(&hub);
        packs.add_sink(Arc::new(move |message: &plcgate::publish::PackMessage| {
            pack_hub.broadcast_pack(message)
        }));
        manager.on_changes(packs);
    }

    let health_hub = Arc::clone(&hub);
    let health_task = spawn_health_loop(
        Arc::clone(&manager),
        publishers.clone(),
        Some(Arc::new(
            move |message: &plcgate::publish::HealthMessage| {
                health_hub.broadcast_health(message)
            },
        )),
        transports.clone(),
    );

    manager.start().await;
    manager.connect_enabled().await;

    let state = ApiState {
        manager: Arc::clone(&manager),
        hub,
        gateway,
        executor: Arc::new(WriteExecutor::default()),
    };
    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    info!(bind = %settings.server.bind, "api server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    transports.cancel();
    manager.stop().await;
    for publisher in &publishers {
        publisher.stop().await;
    }
    health_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
