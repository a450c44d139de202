use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::mpsc::unbounded_channel};

use crate::{
    api, config::Config, protocol::Error, rooms::Handle, session::Service,
    statistics::Statistics,
};

pub struct ServerState {
    pub config: Arc<Config>,
    pub service: Service,
    pub statistics: Statistics,
    pub uptime: Instant,
}

/// Start the http server: the websocket signaling endpoint at `/`, plus
/// the admin view when a password is configured.
pub async fn start(
    config: Arc<Config>,
    service: Service,
    statistics: Statistics,
) -> anyhow::Result<()> {
    let state = Arc::new(ServerState {
        config: config.clone(),
        uptime: Instant::now(),
        service,
        statistics,
    });

    let mut app = Router::new().route("/", get(upgrade));

    if config.admin_password.is_some() {
        app = app.merge(api::routes());
    }

    let listener = TcpListener::bind(config.bind()).await?;

    log::info!("signaling server listening={:?}", config.bind());

    axum::serve(
        listener,
        app.with_state(state)
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Resolve the remote address the way proxies present it: first segment
/// of `X-Forwarded-For` when present, else the peer address.
fn remote_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

async fn upgrade(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let remote_ip = remote_ip(&headers, addr);

    // Admission is decided before the handshake completes; an over-quota
    // address observes a plain connect failure.
    if !state.service.admit(&remote_ip) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Error::ConnectionRateLimited.to_string(),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| drive(state, socket, remote_ip))
        .into_response()
}

/// Per-connection driver.
///
/// Owns the socket for the connection's life and multiplexes three
/// sources: inbound RPC frames (answered synchronously), registry events
/// queued on the handle's channel, and the idle timer. Any exit path
/// falls through to the registry disconnect hook.
async fn drive(state: Arc<ServerState>, socket: WebSocket, remote_ip: String) {
    let (tx, mut rx) = unbounded_channel();
    let handle = Handle::new(remote_ip, tx);

    log::info!(
        "connection opened: conn={:?}, addr={:?}",
        handle.id,
        handle.remote_ip
    );

    let (mut sink, mut stream) = socket.split();

    let idle = state.config.idle_timeout();
    let timer = tokio::time::sleep(idle);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };

                let Ok(frame) = serde_json::to_string(&event) else {
                    continue;
                };

                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(frame))) => {
                        // Every inbound RPC resets the idle clock.
                        timer.as_mut().reset(tokio::time::Instant::now() + idle);

                        let reply = state.service.dispatch(&handle, frame.as_str());
                        if sink.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                    // Ping/pong is answered by the protocol layer; binary
                    // frames have no meaning here.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = &mut timer => {
                log::info!("idle timeout: conn={:?}", handle.id);
                break;
            }
        }
    }

    state.service.disconnect(&handle);

    log::info!("connection closed: conn={:?}", handle.id);
}
