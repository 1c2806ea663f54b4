//! Web server exposing one serial session to the browser.
//!
//! Run with: cargo run -p web-server-demo
//! Or, without hardware: cargo run -p web-server-demo -- --demo
//!
//! Then open http://localhost:3000 in your browser.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use axum::{Router, response::Html, routing::get};
use serial_link_core::{SerialConfig, SerialPlatform};
use serial_link_session::{
    ConnectionManager,
    platform::{MemoryPlatform, MemoryPortHandle, NativePlatform},
};
use serial_link_transport::create_ws_router;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ENV_LISTEN_ADDR: &str = "LISTEN_ADDR";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = SerialConfig::from_env().context("Invalid serial configuration")?;
    let addr: SocketAddr = std::env::var(ENV_LISTEN_ADDR)
        .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
        .parse()
        .with_context(|| format!("Invalid {ENV_LISTEN_ADDR}"))?;

    if std::env::args().any(|arg| arg == "--demo") {
        let platform = MemoryPlatform::new("demo0");
        tokio::spawn(simulate_device(platform.handle()));
        tracing::info!("Using simulated device");
        serve(
            ConnectionManager::with_baud_rate(platform, config.baud_rate),
            addr,
        )
        .await
    } else {
        let baud_rate = config.baud_rate;
        serve(
            ConnectionManager::with_baud_rate(NativePlatform::new(config), baud_rate),
            addr,
        )
        .await
    }
}

async fn serve<P>(manager: ConnectionManager<P>, addr: SocketAddr) -> anyhow::Result<()>
where
    P: SerialPlatform,
{
    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_ws_router(manager.clone()))
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("Server error")?;

    manager.disconnect().await;
    Ok(())
}

/// Feed framed readings into the simulated device while it is open.
async fn simulate_device(handle: MemoryPortHandle) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut reading: u64 = 0;
    loop {
        ticker.tick().await;
        if handle.is_open() {
            reading += 1;
            handle.push(format!("~<temp={}.{}>", 20 + reading % 5, reading % 10));
        }
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Serial Link</title>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            color: #d4d4d4;
            font-family: system-ui, sans-serif;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        .status {
            color: #888;
            font-size: 14px;
            margin-bottom: 10px;
        }
        .open { color: #4a4; }
        .closed { color: #a44; }
        #messages {
            font-family: Menlo, Monaco, "Courier New", monospace;
            height: calc(100vh - 220px);
            overflow-y: auto;
            border: 1px solid #333;
            padding: 8px;
        }
        .error { color: #e66; }
    </style>
</head>
<body>
    <h1>Serial Link</h1>
    <div class="status" id="status">Connecting...</div>
    <div>
        <button id="toggle" disabled>Connect</button>
        <select id="baud">
            <option>9600</option>
            <option>19200</option>
            <option>38400</option>
            <option>57600</option>
            <option selected>115200</option>
        </select>
        <span id="count">0 messages</span>
    </div>
    <p id="error" class="error"></p>
    <div id="messages"></div>

    <script>
        const status = document.getElementById('status');
        const toggle = document.getElementById('toggle');
        const baud = document.getElementById('baud');
        const count = document.getElementById('count');
        const errorBox = document.getElementById('error');
        const messages = document.getElementById('messages');
        let ws;
        let portState = 'closed';
        let received = 0;

        function send(msg) {
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(JSON.stringify(msg));
            }
        }

        function render(msg) {
            portState = msg.state;
            status.textContent = msg.can_use_serial
                ? `Port ${msg.state} at ${msg.baud_rate} baud`
                : 'Serial is not available on this host';
            status.className = 'status ' + (msg.state === 'open' ? 'open' : 'closed');
            baud.value = String(msg.baud_rate);
            baud.disabled = msg.state !== 'closed';
            toggle.disabled = !msg.can_use_serial
                || msg.state === 'opening' || msg.state === 'closing';
            toggle.textContent = msg.state === 'open' ? 'Disconnect' : 'Connect';
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);

            ws.onclose = () => {
                status.textContent = 'Server unreachable - reconnecting...';
                status.className = 'status closed';
                toggle.disabled = true;
                setTimeout(connect, 2000);
            };

            ws.onmessage = (event) => {
                const msg = JSON.parse(event.data);
                if (msg.type === 'state') {
                    render(msg);
                } else if (msg.type === 'message') {
                    received += 1;
                    count.textContent = `${received} messages`;
                    const line = document.createElement('div');
                    line.textContent = `${new Date(msg.timestamp).toLocaleTimeString()}  ${msg.value}`;
                    messages.appendChild(line);
                    messages.scrollTop = messages.scrollHeight;
                } else if (msg.type === 'error') {
                    errorBox.textContent = msg.message;
                }
            };
        }

        toggle.addEventListener('click', () => {
            errorBox.textContent = '';
            send({ type: portState === 'open' ? 'disconnect' : 'connect' });
        });

        baud.addEventListener('change', () => {
            send({ type: 'set_baud_rate', baud_rate: Number(baud.value) });
        });

        connect();
    </script>
</body>
</html>
"#;
