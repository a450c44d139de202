use std::{sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    code,
    config::Config,
    limiter::RateLimiter,
    protocol::{
        ApproveParams, Error, IceConfig, IceServer, JoinParams, PeerDecision, RejoinParams,
        Request, Response, RoomCreated, RoomJoined, RoomRejoined, SignalParams, Signaled,
    },
    rooms::{Handle, Registry},
    statistics::Statistics,
};

/// Display name used when a joining peer does not supply one.
const DEFAULT_PEER_NAME: &str = "Anonymous";

/// Pre-configured limiter windows, one instance per abuse vector.
struct Limiters {
    /// Transport handshakes per address.
    connection: RateLimiter,
    /// createRoom calls per address.
    create: RateLimiter,
    /// joinRoom calls per address.
    join: RateLimiter,
    /// signal calls per connection.
    signal: RateLimiter,
}

impl Default for Limiters {
    fn default() -> Self {
        Self {
            connection: RateLimiter::new(Duration::from_secs(60), 20),
            create: RateLimiter::new(Duration::from_secs(60), 5),
            join: RateLimiter::new(Duration::from_secs(60), 30),
            signal: RateLimiter::new(Duration::from_secs(1), 50),
        }
    }
}

pub struct ServiceOptions {
    pub config: Arc<Config>,
    pub statistics: Statistics,
}

/// The session coordinator: the RPC method surface over the registry.
///
/// Every mutating method runs rate limiting and shape validation before
/// touching the registry, and decorates successful replies with the ICE
/// server hint where the protocol calls for it. Cloning is cheap; one
/// clone lives in every connection driver.
#[derive(Clone)]
pub struct Service {
    config: Arc<Config>,
    registry: Arc<Registry>,
    limiters: Arc<Limiters>,
    statistics: Statistics,
}

impl Service {
    pub fn new(options: ServiceOptions) -> Self {
        Self {
            config: options.config,
            registry: Arc::new(Registry::default()),
            limiters: Arc::new(Limiters::default()),
            statistics: options.statistics,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Total keys currently tracked across all limiter instances.
    pub fn limiter_keys(&self) -> usize {
        self.limiters.connection.tracked_keys()
            + self.limiters.create.tracked_keys()
            + self.limiters.join.tracked_keys()
            + self.limiters.signal.tracked_keys()
    }

    /// Background sweep of expired limiter buckets.
    ///
    /// Holds only a weak reference so the task winds down with the last
    /// service clone instead of keeping it alive forever.
    pub fn start_scavenger(&self) {
        let limiters = Arc::downgrade(&self.limiters);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;

            loop {
                interval.tick().await;

                let Some(limiters) = limiters.upgrade() else {
                    break;
                };

                limiters.connection.cleanup();
                limiters.create.cleanup();
                limiters.join.cleanup();
                limiters.signal.cleanup();
            }
        });
    }

    /// Connection admission, applied before the transport handshake.
    pub fn admit(&self, ip: &str) -> bool {
        if self.limiters.connection.allow(ip) {
            self.statistics.connections.add(1);
            true
        } else {
            self.statistics.connections_refused.add(1);
            self.statistics.rate_limited.add(1);
            log::warn!("connection refused: addr={:?}", ip);
            false
        }
    }

    /// Registry unwinding for a dropped transport.
    pub fn disconnect(&self, handle: &Handle) {
        self.registry.handle_disconnect(handle);
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.config
            .stun_servers
            .iter()
            .map(|urls| IceServer { urls: urls.clone() })
            .collect()
    }

    /// Decode one inbound frame, run the method and encode the reply.
    ///
    /// Domain errors become `{error}` reply data on the request's id;
    /// frames that do not parse at all are answered on id 0.
    pub fn dispatch(&self, handle: &Handle, frame: &str) -> String {
        self.statistics.rpcs.add(1);

        let (id, result) = match serde_json::from_str::<Request>(frame) {
            Ok(request) => (request.id, self.run(handle, &request)),
            Err(_) => (0, Err(Error::BadRequest)),
        };

        let response = Response {
            id,
            result: result.unwrap_or_else(Error::into_reply),
        };

        // A reply object always serializes.
        serde_json::to_string(&response).unwrap_or_else(|_| String::from("{}"))
    }

    fn run(&self, handle: &Handle, request: &Request) -> Result<Value, Error> {
        match request.method.as_str() {
            "createRoom" => to_value(self.create_room(handle)?),
            "joinRoom" => {
                let params: JoinParams = parse(&request.params)?;
                to_value(self.join_room(handle, &params.code, params.name.as_deref())?)
            }
            "rejoinRoom" => {
                let params: RejoinParams = parse(&request.params)?;
                self.rejoin_room(handle, &params.code, params.is_host, params.name.as_deref())
            }
            "approvePeer" => {
                let params: ApproveParams = parse(&request.params)?;
                to_value(self.approve_peer(handle, &params.peer_id, params.approved)?)
            }
            "signal" => {
                let params: SignalParams = parse(&request.params)?;
                to_value(self.signal(handle, &params.to, params.payload)?)
            }
            "getIceServers" => to_value(IceConfig {
                ice_servers: self.ice_servers(),
            }),
            _ => Err(Error::BadRequest),
        }
    }

    pub fn create_room(&self, handle: &Handle) -> Result<RoomCreated, Error> {
        if !self.limiters.create.allow(&handle.remote_ip) {
            self.statistics.rate_limited.add(1);
            return Err(Error::RoomRateLimited);
        }

        let room_code = self
            .registry
            .create_room(handle, self.config.max_rooms_per_ip)?;

        self.statistics.rooms_created.add(1);
        log::info!(
            "room created: code={:?}, host={:?}, addr={:?}",
            room_code,
            handle.id,
            handle.remote_ip
        );

        Ok(RoomCreated {
            success: true,
            code: room_code,
            ice_servers: self.ice_servers(),
        })
    }

    pub fn join_room(
        &self,
        handle: &Handle,
        raw_code: &str,
        name: Option<&str>,
    ) -> Result<RoomJoined, Error> {
        if !self.limiters.join.allow(&handle.remote_ip) {
            self.statistics.rate_limited.add(1);
            return Err(Error::JoinRateLimited);
        }

        if !code::validate(raw_code) {
            return Err(Error::InvalidCode);
        }

        let room_code = code::normalize(raw_code);
        let name = name.unwrap_or(DEFAULT_PEER_NAME);

        let joined = self.registry.join_room(
            handle,
            &room_code,
            name,
            self.config.max_pending_per_room,
        )?;

        self.statistics.joins.add(1);
        log::info!(
            "join requested: code={:?}, peer={:?}, name={:?}",
            room_code,
            handle.id,
            name
        );

        Ok(RoomJoined {
            success: true,
            peer_id: joined.peer_id,
            host_connected: joined.host_connected,
            ice_servers: self.ice_servers(),
        })
    }

    /// Host path re-seats the host on a live room; the peer path is a
    /// plain join and goes back through host approval.
    pub fn rejoin_room(
        &self,
        handle: &Handle,
        raw_code: &str,
        is_host: bool,
        name: Option<&str>,
    ) -> Result<Value, Error> {
        let room_code = code::normalize(raw_code);

        if is_host {
            let peers = self.registry.rejoin_host(handle, &room_code)?;

            log::info!(
                "host rejoined: code={:?}, host={:?}, peers={}",
                room_code,
                handle.id,
                peers.len()
            );

            to_value(RoomRejoined {
                success: true,
                code: room_code,
                peers,
            })
        } else {
            to_value(self.join_room(handle, &room_code, name)?)
        }
    }

    pub fn approve_peer(
        &self,
        handle: &Handle,
        peer_id: &str,
        approved: bool,
    ) -> Result<PeerDecision, Error> {
        let denied = self.registry.approve_peer(handle, peer_id, approved)?;

        log::info!(
            "peer decision: host={:?}, peer={:?}, approved={}",
            handle.id,
            peer_id,
            approved
        );

        Ok(PeerDecision {
            success: true,
            denied: denied.then_some(true),
        })
    }

    pub fn signal(&self, handle: &Handle, to: &str, payload: Value) -> Result<Signaled, Error> {
        if !self.limiters.signal.allow(&handle.id) {
            self.statistics.rate_limited.add(1);
            return Err(Error::SignalRateLimited);
        }

        let size = serde_json::to_string(&payload).map_or(usize::MAX, |s| s.len());
        if size > self.config.max_payload_size {
            return Err(Error::PayloadTooLarge);
        }

        self.registry.signal(handle, to, payload)?;
        self.statistics.signals.add(1);

        Ok(Signaled { success: true })
    }
}

fn parse<'a, T: serde::Deserialize<'a>>(params: &'a Value) -> Result<T, Error> {
    T::deserialize(params).map_err(|_| Error::BadRequest)
}

fn to_value<T: serde::Serialize>(reply: T) -> Result<Value, Error> {
    // Reply types contain nothing that can fail to serialize.
    Ok(serde_json::to_value(reply).unwrap_or(Value::Null))
}
