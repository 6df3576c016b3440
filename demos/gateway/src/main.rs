//! Demo gateway: activates a seeded number against a mock client and streams
//! its session events over WebSocket.
//!
//! Run with: cargo run -p gateway
//!
//! Then open http://localhost:3000 in your browser. Set `PHONELINK_CONFIG` to
//! a TOML file to override workflow settings.

use std::{error::Error, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, response::Html, routing::get};
use phonelink_core::{
    ClientSignal, EventHub, PhoneNumber,
    mock::{MockClientFactory, MockScript},
};
use phonelink_session::{
    ActivationWorkflow, SessionPool, WorkflowConfig, storage::MemoryPhoneStore,
};
use phonelink_transport::websocket::create_ws_router;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_PHONE: &str = "6281234567890";
const DEMO_COUNTRY_CODE: u16 = 62;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::var("PHONELINK_CONFIG") {
        Ok(path) => WorkflowConfig::load_from_path(path)?,
        Err(_) => WorkflowConfig::default(),
    }
    .with_env_overrides()?;

    let hub = Arc::new(EventHub::with_history_limit(config.event_history));
    let store = MemoryPhoneStore::new();
    store.create(DEMO_PHONE, DEMO_COUNTRY_CODE)?;

    let clients = MockClientFactory::with_script(MockScript {
        handshake_code: Some("2@demo-handshake".to_string()),
        ..MockScript::default()
    });

    let workflow = ActivationWorkflow::new(
        store,
        Arc::new(SessionPool::new()),
        Arc::new(clients.clone()),
        hub.clone(),
        config,
    );
    workflow.reconcile().await?;

    let activation = workflow.activate(DEMO_PHONE, DEMO_COUNTRY_CODE).await?;
    tracing::info!(slot = %activation.slot, "demo number activated");

    // Pretend the handset scans the code a few seconds later.
    let number = PhoneNumber::new(DEMO_PHONE, DEMO_COUNTRY_CODE);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if let Some(client) = clients.client(&number) {
            client.emit(ClientSignal::Authenticated);
            client.emit(ClientSignal::Ready);
        }
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_ws_router(hub))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let report = workflow.shutdown().await;
    tracing::info!(
        stopped = report.stopped,
        failures = report.failures.len(),
        "gateway stopped"
    );

    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>phonelink gateway</title>
    <style>
        body { font-family: monospace; background: #1e1e1e; color: #d4d4d4; padding: 20px; }
        #events div { padding: 2px 0; }
    </style>
</head>
<body>
    <h3>+62:6281234567890</h3>
    <div id="events"></div>
    <script>
        const events = document.getElementById('events');
        const ws = new WebSocket(`ws://${location.host}/ws`);
        ws.onopen = () => ws.send(JSON.stringify({
            type: 'subscribe', phone: '6281234567890', country_code: 62
        }));
        ws.onmessage = (msg) => {
            const line = document.createElement('div');
            line.textContent = msg.data;
            events.appendChild(line);
        };
    </script>
</body>
</html>
"#;
