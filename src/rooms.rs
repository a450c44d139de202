use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    code,
    protocol::{Error, Event, PeerInfo},
};

/// A cheap clonable facade over one transport connection.
///
/// The registry never owns connections, the transport does. Rooms keep
/// handle clones; once the transport drops the receiving end, `is_live`
/// turns false and emits become no-ops until the disconnect hook unwinds
/// the registry for real.
#[derive(Debug, Clone)]
pub struct Handle {
    pub id: String,
    pub remote_ip: String,
    tx: UnboundedSender<Event>,
}

impl Handle {
    pub fn new(remote_ip: String, tx: UnboundedSender<Event>) -> Self {
        Self {
            id: connection_id(),
            remote_ip,
            tx,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Fire-and-forget event delivery.
    ///
    /// An unbounded send never blocks, so it is safe to emit while the
    /// registry lock is held; that is also what makes the per-connection
    /// event order follow the lock order.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Generate an opaque connection identifier.
fn connection_id() -> String {
    let mut rng = rand::rng();

    (0..20)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Peer,
}

/// A peer inside a room, pending or approved.
struct PeerEntry {
    handle: Handle,
    name: String,
}

struct Room {
    code: String,
    host: Handle,
    pending: AHashMap<String, PeerEntry>,
    approved: AHashMap<String, PeerEntry>,
    created_at: Instant,
    created_wall: SystemTime,
}

/// Reverse-lookup record for one connection.
///
/// Disconnect events and signal authorization only carry a connection id;
/// without this denormalization every lookup would scan all rooms.
struct IndexEntry {
    code: String,
    role: Role,
    peer_name: Option<String>,
}

#[derive(Default)]
struct Tables {
    rooms: AHashMap<String, Room>,
    conn_index: AHashMap<String, IndexEntry>,
    ip_rooms: AHashMap<String, usize>,
}

/// Successful join, as seen by the joining peer.
pub struct Joined {
    pub peer_id: String,
    pub host_connected: bool,
}

/// Point-in-time view of one room for the admin surface.
pub struct RoomSnapshot {
    pub code: String,
    pub host_live: bool,
    pub pending: usize,
    pub approved: usize,
    pub created_at: u64,
    pub age_seconds: u64,
}

pub struct Snapshot {
    pub rooms: Vec<RoomSnapshot>,
    pub total_pending: usize,
    pub total_approved: usize,
}

/// Membership view of one room, used by tests and diagnostics.
pub struct RoomMembers {
    pub host_id: String,
    pub pending: Vec<String>,
    pub approved: Vec<String>,
}

/// The in-memory control plane: rooms, the connection index and the
/// per-IP room ownership counters.
///
/// All three tables live behind one mutex and every operation is a single
/// critical section, so no interleaving of RPCs and disconnects can leave
/// the index out of sync with room membership. Operations never await;
/// the only work done under the lock besides map mutation is enqueueing
/// events on unbounded channels.
#[derive(Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    /// Create a room hosted by `handle` and return its rendezvous code.
    ///
    /// Codes are redrawn until unused; with 44 bits of entropy a redraw is
    /// practically unreachable below ~10^5 concurrent rooms. The per-IP cap
    /// is checked and the counter incremented in the same critical section.
    pub fn create_room(&self, handle: &Handle, max_rooms_per_ip: usize) -> Result<String, Error> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        if tables.conn_index.contains_key(&handle.id) {
            return Err(Error::AlreadyInRoom);
        }

        let hosted = tables.ip_rooms.get(&handle.remote_ip).copied().unwrap_or(0);
        if hosted >= max_rooms_per_ip {
            return Err(Error::IpRoomCap(max_rooms_per_ip));
        }

        let code = loop {
            let candidate = code::generate();
            if !tables.rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        tables.rooms.insert(
            code.clone(),
            Room {
                code: code.clone(),
                host: handle.clone(),
                pending: AHashMap::new(),
                approved: AHashMap::new(),
                created_at: Instant::now(),
                created_wall: SystemTime::now(),
            },
        );

        tables.conn_index.insert(
            handle.id.clone(),
            IndexEntry {
                code: code.clone(),
                role: Role::Host,
                peer_name: None,
            },
        );

        *tables.ip_rooms.entry(handle.remote_ip.clone()).or_insert(0) += 1;

        Ok(code)
    }

    /// Ask to join the room `code` under the display name `name`.
    ///
    /// The peer lands in `pending` and the host is notified with
    /// `peer:request`; nothing else is possible until the host decides.
    pub fn join_room(
        &self,
        handle: &Handle,
        room_code: &str,
        name: &str,
        max_pending: usize,
    ) -> Result<Joined, Error> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        if tables.conn_index.contains_key(&handle.id) {
            return Err(Error::AlreadyInRoom);
        }

        let room = tables.rooms.get_mut(room_code).ok_or(Error::RoomNotFound)?;

        if room.pending.len() >= max_pending {
            return Err(Error::PendingFull);
        }

        room.pending.insert(
            handle.id.clone(),
            PeerEntry {
                handle: handle.clone(),
                name: name.to_string(),
            },
        );

        let host_connected = room.host.is_live();
        room.host.emit(Event::PeerRequest {
            peer_id: handle.id.clone(),
            name: name.to_string(),
        });

        tables.conn_index.insert(
            handle.id.clone(),
            IndexEntry {
                code: room_code.to_string(),
                role: Role::Peer,
                peer_name: Some(name.to_string()),
            },
        );

        Ok(Joined {
            peer_id: handle.id.clone(),
            host_connected,
        })
    }

    /// Decide on a pending peer. Only the room's host may call this.
    ///
    /// Approval moves the peer into `approved` and tells it the host id to
    /// signal to. Denial removes the peer from the room entirely; its
    /// transport stays open and it may ask to join elsewhere.
    ///
    /// Returns whether the decision was a denial.
    pub fn approve_peer(
        &self,
        handle: &Handle,
        peer_id: &str,
        approved: bool,
    ) -> Result<bool, Error> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let entry = tables.conn_index.get(&handle.id).ok_or(Error::NotInRoom)?;
        if entry.role != Role::Host {
            return Err(Error::NotAHost);
        }

        let room_code = entry.code.clone();
        let Some(room) = tables.rooms.get_mut(&room_code) else {
            debug_assert!(false, "conn index references a missing room");
            log::error!("conn index references a missing room: code={:?}", room_code);
            return Err(Error::RoomNotFound);
        };

        let peer = room.pending.remove(peer_id).ok_or(Error::PeerNotPending)?;

        if approved {
            let target = peer.handle.clone();
            room.approved.insert(peer_id.to_string(), peer);
            target.emit(Event::PeerApproved {
                host_id: room.host.id.clone(),
            });

            Ok(false)
        } else {
            peer.handle.emit(Event::PeerDenied {});
            tables.conn_index.remove(peer_id);

            Ok(true)
        }
    }

    /// Route one opaque signaling payload to `to` on behalf of `handle`.
    ///
    /// The sender must be the room's host or one of its approved peers;
    /// the target must be the host or an approved peer. Pending peers are
    /// never valid targets. The payload is forwarded without inspection.
    pub fn signal(&self, handle: &Handle, to: &str, payload: Value) -> Result<(), Error> {
        let guard = self.tables.lock();

        let entry = guard.conn_index.get(&handle.id).ok_or(Error::NotInRoom)?;
        let Some(room) = guard.rooms.get(&entry.code) else {
            debug_assert!(false, "conn index references a missing room");
            log::error!("conn index references a missing room: code={:?}", entry.code);
            return Err(Error::RoomNotFound);
        };

        if handle.id != room.host.id && !room.approved.contains_key(&handle.id) {
            return Err(Error::NotAuthorized);
        }

        let target = if to == room.host.id {
            &room.host
        } else {
            &room
                .approved
                .get(to)
                .ok_or(Error::TargetNotFound)?
                .handle
        };

        target.emit(Event::Signal {
            from: handle.id.clone(),
            payload,
        });

        Ok(())
    }

    /// Re-seat `handle` as the host of an existing room.
    ///
    /// Usable only while the room still exists, which ties it to clients
    /// that open a replacement transport before the previous one drops:
    /// the stale host's index entry is removed here, so the old
    /// transport's eventual disconnect no longer tears the room down.
    /// Every approved peer learns the new host id via `host:reconnected`.
    pub fn rejoin_host(&self, handle: &Handle, room_code: &str) -> Result<Vec<PeerInfo>, Error> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        // Only an unbound connection, or the room's current host itself,
        // may take the host seat; a peer of the room cannot seize it.
        if let Some(existing) = tables.conn_index.get(&handle.id) {
            if existing.code != room_code || existing.role != Role::Host {
                return Err(Error::AlreadyInRoom);
            }
        }

        let room = tables.rooms.get_mut(room_code).ok_or(Error::RoomNotFound)?;

        let previous = room.host.clone();
        room.host = handle.clone();

        let peers = room
            .approved
            .iter()
            .map(|(id, peer)| PeerInfo {
                id: id.clone(),
                name: peer.name.clone(),
            })
            .collect();

        for peer in room.approved.values() {
            peer.handle.emit(Event::HostReconnected {
                host_id: handle.id.clone(),
            });
        }

        if previous.id != handle.id {
            tables.conn_index.remove(&previous.id);

            // Room ownership follows the current host, keep the per-IP
            // accounting keyed to the address that will be unwound on
            // disconnect.
            if previous.remote_ip != handle.remote_ip {
                if let Some(count) = tables.ip_rooms.get_mut(&previous.remote_ip) {
                    *count -= 1;
                    if *count == 0 {
                        tables.ip_rooms.remove(&previous.remote_ip);
                    }
                }

                *tables.ip_rooms.entry(handle.remote_ip.clone()).or_insert(0) += 1;
            }
        }

        tables.conn_index.insert(
            handle.id.clone(),
            IndexEntry {
                code: room_code.to_string(),
                role: Role::Host,
                peer_name: None,
            },
        );

        Ok(peers)
    }

    /// Unwind all registry state attached to a dropped connection.
    ///
    /// Host branch: the room dies with its host. Every pending and
    /// approved peer receives `host:disconnected` exactly once and loses
    /// its index entry, but the peer transports stay open and may issue
    /// fresh createRoom/joinRoom calls. Peer branch: the peer is removed
    /// from whichever set holds it and the host is told.
    pub fn handle_disconnect(&self, handle: &Handle) {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let Some(entry) = tables.conn_index.remove(&handle.id) else {
            return;
        };

        match entry.role {
            Role::Host => {
                let Some(room) = tables.rooms.remove(&entry.code) else {
                    debug_assert!(false, "conn index references a missing room");
                    log::error!("conn index references a missing room: code={:?}", entry.code);
                    return;
                };

                for (peer_id, peer) in room.pending.iter().chain(room.approved.iter()) {
                    peer.handle.emit(Event::HostDisconnected {});
                    tables.conn_index.remove(peer_id);
                }

                if let Some(count) = tables.ip_rooms.get_mut(&handle.remote_ip) {
                    *count -= 1;
                    if *count == 0 {
                        tables.ip_rooms.remove(&handle.remote_ip);
                    }
                }

                log::info!(
                    "room destroyed: code={:?}, peers={}",
                    room.code,
                    room.pending.len() + room.approved.len()
                );
            }
            Role::Peer => {
                let Some(room) = tables.rooms.get_mut(&entry.code) else {
                    debug_assert!(false, "conn index references a missing room");
                    log::error!("conn index references a missing room: code={:?}", entry.code);
                    return;
                };

                let removed = room
                    .pending
                    .remove(&handle.id)
                    .or_else(|| room.approved.remove(&handle.id));

                if removed.is_some() {
                    room.host.emit(Event::PeerDisconnected {
                        peer_id: handle.id.clone(),
                    });

                    log::info!(
                        "peer left: code={:?}, peer={:?}, name={:?}",
                        entry.code,
                        handle.id,
                        entry.peer_name
                    );
                }
            }
        }
    }

    /// Consistent point-in-time view for the admin surface.
    pub fn snapshot(&self) -> Snapshot {
        let guard = self.tables.lock();

        let mut total_pending = 0;
        let mut total_approved = 0;

        let rooms = guard
            .rooms
            .values()
            .map(|room| {
                total_pending += room.pending.len();
                total_approved += room.approved.len();

                RoomSnapshot {
                    code: room.code.clone(),
                    host_live: room.host.is_live(),
                    pending: room.pending.len(),
                    approved: room.approved.len(),
                    created_at: room
                        .created_wall
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                    age_seconds: room.created_at.elapsed().as_secs(),
                }
            })
            .collect();

        Snapshot {
            rooms,
            total_pending,
            total_approved,
        }
    }

    /// Whether a room with this code currently exists.
    pub fn contains(&self, room_code: &str) -> bool {
        self.tables.lock().rooms.contains_key(room_code)
    }

    /// Whether a connection id is currently bound to any room.
    pub fn indexed(&self, conn_id: &str) -> bool {
        self.tables.lock().conn_index.contains_key(conn_id)
    }

    /// How many rooms this address currently hosts.
    pub fn hosted_rooms(&self, ip: &str) -> usize {
        self.tables.lock().ip_rooms.get(ip).copied().unwrap_or(0)
    }

    /// Membership view of one room.
    pub fn room_members(&self, room_code: &str) -> Option<RoomMembers> {
        let guard = self.tables.lock();
        let room = guard.rooms.get(room_code)?;

        Some(RoomMembers {
            host_id: room.host.id.clone(),
            pending: room.pending.keys().cloned().collect(),
            approved: room.approved.keys().cloned().collect(),
        })
    }
}
