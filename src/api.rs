use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
};

use serde::Deserialize;
use serde_json::json;

use crate::server::ServerState;

/// Admin routes, mounted only when an admin password is configured.
///
/// The password check is deliberately minimal (query parameter or
/// `x-admin-password` header); the view is read-only and the interesting
/// part is the snapshot, not the gate.
pub fn routes() -> Router<Arc<ServerState>> {
    Router::new()
        .route("/admin", get(dashboard))
        .route("/admin/api/stats", get(stats))
}

#[derive(Deserialize)]
struct AdminQuery {
    password: Option<String>,
}

fn authorized(state: &ServerState, headers: &HeaderMap, query: &AdminQuery) -> bool {
    let Some(expected) = state.config.admin_password.as_deref() else {
        return false;
    };

    let presented = query.password.as_deref().or_else(|| {
        headers
            .get("x-admin-password")
            .and_then(|value| value.to_str().ok())
    });

    presented == Some(expected)
}

async fn stats(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let snapshot = state.service.registry().snapshot();

    Json(json!({
        "software": crate::SOFTWARE,
        "uptime": state.uptime.elapsed().as_secs(),
        "totalRooms": snapshot.rooms.len(),
        "totalPending": snapshot.total_pending,
        "totalApproved": snapshot.total_approved,
        "rooms": snapshot
            .rooms
            .iter()
            .map(|room| {
                json!({
                    "code": room.code,
                    "hostLive": room.host_live,
                    "pendingCount": room.pending,
                    "approvedCount": room.approved,
                    "createdAt": room.created_at,
                    "ageSeconds": room.age_seconds,
                })
            })
            .collect::<Vec<_>>(),
        "counters": {
            "connections": state.statistics.connections.get(),
            "connectionsRefused": state.statistics.connections_refused.get(),
            "rpcs": state.statistics.rpcs.get(),
            "rateLimited": state.statistics.rate_limited.get(),
            "roomsCreated": state.statistics.rooms_created.get(),
            "joins": state.statistics.joins.get(),
            "signals": state.statistics.signals.get(),
            "limiterKeys": state.service.limiter_keys(),
        },
    }))
    .into_response()
}

async fn dashboard(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let snapshot = state.service.registry().snapshot();

    let mut rows = String::new();
    for room in &snapshot.rooms {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}s</td></tr>",
            room.code,
            if room.host_live { "live" } else { "gone" },
            room.pending,
            room.approved,
            room.age_seconds,
        ));
    }

    Html(format!(
        "<!doctype html><html><head><title>{software}</title></head><body>\
         <h1>{software}</h1>\
         <p>uptime {uptime}s, rooms {rooms}, pending {pending}, approved {approved}</p>\
         <table border=\"1\" cellpadding=\"4\">\
         <tr><th>code</th><th>host</th><th>pending</th><th>approved</th><th>age</th></tr>\
         {rows}\
         </table></body></html>",
        software = crate::SOFTWARE,
        uptime = state.uptime.elapsed().as_secs(),
        rooms = snapshot.rooms.len(),
        pending = snapshot.total_pending,
        approved = snapshot.total_approved,
        rows = rows,
    ))
    .into_response()
}
