use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One inbound RPC frame.
///
/// The transport carries JSON text frames of the shape
/// `{"id": 1, "method": "joinRoom", "params": {...}}`. Parameters stay an
/// opaque [`Value`] here and are given a shape per method by the session
/// coordinator, so an unknown method or malformed params can still be
/// answered on the right request id.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// One outbound RPC frame: `{"id": 1, "result": {...}}`.
///
/// The result object is either a success reply or `{"error": "..."}`;
/// domain failures never surface as transport faults.
#[derive(Debug, PartialEq, Serialize)]
pub struct Response {
    pub id: u64,
    pub result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinParams {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejoinParams {
    pub code: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveParams {
    pub peer_id: String,
    pub approved: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalParams {
    pub to: String,
    pub payload: Value,
}

/// A single entry of the `iceServers` hint attached to room replies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IceServer {
    pub urls: String,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub success: bool,
    pub code: String,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub success: bool,
    pub peer_id: String,
    pub host_connected: bool,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRejoined {
    pub success: bool,
    pub code: String,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDecision {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied: Option<bool>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct Signaled {
    pub success: bool,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Server-originated events, delivered as `{"event": "...", "data": {...}}`.
///
/// Events are fire-and-forget: the registry enqueues them on the target
/// connection's channel while holding its lock, which is what guarantees
/// per-connection ordering (`peer:request` before `peer:approved` before
/// any `signal`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "peer:request", rename_all = "camelCase")]
    PeerRequest { peer_id: String, name: String },
    #[serde(rename = "peer:approved", rename_all = "camelCase")]
    PeerApproved { host_id: String },
    #[serde(rename = "peer:denied")]
    PeerDenied {},
    #[serde(rename = "host:disconnected")]
    HostDisconnected {},
    #[serde(rename = "host:reconnected", rename_all = "camelCase")]
    HostReconnected { host_id: String },
    #[serde(rename = "peer:disconnected", rename_all = "camelCase")]
    PeerDisconnected { peer_id: String },
    #[serde(rename = "signal")]
    Signal { from: String, payload: Value },
}

/// The domain error taxonomy.
///
/// Display strings are the exact texts surfaced in `{error}` replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Bad request")]
    BadRequest,
    #[error("Invalid code format")]
    InvalidCode,
    #[error("Room not found")]
    RoomNotFound,
    #[error("Not a host")]
    NotAHost,
    #[error("Peer not found in pending")]
    PeerNotPending,
    #[error("Not in a room")]
    NotInRoom,
    #[error("Already in a room")]
    AlreadyInRoom,
    #[error("Not authorized to signal")]
    NotAuthorized,
    #[error("Target not found")]
    TargetNotFound,
    #[error("Too many connections from this address. Please try again later.")]
    ConnectionRateLimited,
    #[error("Too many rooms created. Please wait a moment.")]
    RoomRateLimited,
    #[error("Too many join attempts. Please wait a moment.")]
    JoinRateLimited,
    #[error("Too many signals. Slow down.")]
    SignalRateLimited,
    #[error("Maximum {0} rooms per IP reached.")]
    IpRoomCap(usize),
    #[error("Payload too large.")]
    PayloadTooLarge,
    #[error("Room has too many pending requests. Please try again later.")]
    PendingFull,
}

impl Error {
    /// Render the error as RPC reply data.
    ///
    /// # Example
    ///
    /// ```
    /// use signaling_server::protocol::Error;
    ///
    /// assert_eq!(
    ///     Error::RoomNotFound.into_reply().to_string(),
    ///     "{\"error\":\"Room not found\"}"
    /// );
    /// ```
    pub fn into_reply(self) -> Value {
        serde_json::json!({ "error": self.to_string() })
    }
}
