use std::{sync::Arc, thread::sleep, time::Duration};

use clap::Parser;
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use signaling_server::{
    config::Config,
    limiter::RateLimiter,
    protocol::{Error, Event},
    rooms::Handle,
    session::{Service, ServiceOptions},
    statistics::Statistics,
};

fn service() -> Service {
    Service::new(ServiceOptions {
        config: Arc::new(Config::try_parse_from(["signaling-server"]).unwrap()),
        statistics: Statistics::default(),
    })
}

fn connect(ip: &str) -> (Handle, UnboundedReceiver<Event>) {
    let (tx, rx) = unbounded_channel();
    (Handle::new(ip.to_string(), tx), rx)
}

fn recv(rx: &mut UnboundedReceiver<Event>) -> Event {
    rx.try_recv().expect("expected a queued event")
}

fn assert_idle(rx: &mut UnboundedReceiver<Event>) {
    assert!(rx.try_recv().is_err(), "expected no queued event");
}

#[test]
fn happy_path() {
    let service = service();

    let (host, mut host_rx) = connect("10.0.0.1");
    let created = service.create_room(&host).unwrap();
    assert!(created.success);
    assert_eq!(created.ice_servers.len(), 2);

    let (peer, mut peer_rx) = connect("10.0.0.2");
    let joined = service
        .join_room(&peer, &created.code, Some("Alice"))
        .unwrap();
    assert!(joined.success);
    assert!(joined.host_connected);
    assert_eq!(joined.peer_id, peer.id);

    match recv(&mut host_rx) {
        Event::PeerRequest { peer_id, name } => {
            assert_eq!(peer_id, peer.id);
            assert_eq!(name, "Alice");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let decision = service.approve_peer(&host, &peer.id, true).unwrap();
    assert!(decision.success);
    assert_eq!(decision.denied, None);

    match recv(&mut peer_rx) {
        Event::PeerApproved { host_id } => assert_eq!(host_id, host.id),
        other => panic!("unexpected event: {other:?}"),
    }

    service.signal(&peer, &host.id, json!({"sdp": "x"})).unwrap();
    match recv(&mut host_rx) {
        Event::Signal { from, payload } => {
            assert_eq!(from, peer.id);
            assert_eq!(payload, json!({"sdp": "x"}));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    service.signal(&host, &peer.id, json!({"sdp": "y"})).unwrap();
    match recv(&mut peer_rx) {
        Event::Signal { from, payload } => {
            assert_eq!(from, host.id);
            assert_eq!(payload, json!({"sdp": "y"}));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Membership stayed disjoint and the host is in neither set.
    let members = service.registry().room_members(&created.code).unwrap();
    assert_eq!(members.host_id, host.id);
    assert_eq!(members.pending.len(), 0);
    assert_eq!(members.approved, vec![peer.id.clone()]);
}

#[test]
fn denied_peer_is_out_of_the_room() {
    let service = service();

    let (host, mut host_rx) = connect("10.0.1.1");
    let created = service.create_room(&host).unwrap();

    let (peer, mut peer_rx) = connect("10.0.1.2");
    service.join_room(&peer, &created.code, None).unwrap();

    match recv(&mut host_rx) {
        Event::PeerRequest { name, .. } => assert_eq!(name, "Anonymous"),
        other => panic!("unexpected event: {other:?}"),
    }

    let decision = service.approve_peer(&host, &peer.id, false).unwrap();
    assert_eq!(decision.denied, Some(true));

    match recv(&mut peer_rx) {
        Event::PeerDenied {} => {}
        other => panic!("unexpected event: {other:?}"),
    }

    // The connection survives the denial but is no longer in any room.
    assert!(!service.registry().indexed(&peer.id));
    assert_eq!(
        service.signal(&peer, &host.id, json!({"sdp": "x"})),
        Err(Error::NotInRoom)
    );
    assert_idle(&mut host_rx);
}

#[test]
fn pending_flood_is_capped() {
    let service = service();

    let (host, _host_rx) = connect("10.0.2.1");
    let created = service.create_room(&host).unwrap();

    for i in 0..10 {
        let (peer, _rx) = connect(&format!("10.0.2.{}", i + 2));
        service.join_room(&peer, &created.code, None).unwrap();
    }

    let (peer, _rx) = connect("10.0.2.200");
    assert_eq!(
        service.join_room(&peer, &created.code, None),
        Err(Error::PendingFull)
    );
}

#[test]
fn host_disconnect_destroys_the_room() {
    let service = service();

    let (host, _host_rx) = connect("10.0.3.1");
    let created = service.create_room(&host).unwrap();
    assert_eq!(service.registry().hosted_rooms("10.0.3.1"), 1);

    let (peer, mut peer_rx) = connect("10.0.3.2");
    service.join_room(&peer, &created.code, None).unwrap();
    service.approve_peer(&host, &peer.id, true).unwrap();

    let (waiting, mut waiting_rx) = connect("10.0.3.3");
    service.join_room(&waiting, &created.code, None).unwrap();

    service.disconnect(&host);

    // Approved and pending peers both hear it, exactly once.
    recv(&mut peer_rx); // peer:approved
    match recv(&mut peer_rx) {
        Event::HostDisconnected {} => {}
        other => panic!("unexpected event: {other:?}"),
    }
    assert_idle(&mut peer_rx);

    match recv(&mut waiting_rx) {
        Event::HostDisconnected {} => {}
        other => panic!("unexpected event: {other:?}"),
    }
    assert_idle(&mut waiting_rx);

    assert!(!service.registry().contains(&created.code));
    assert_eq!(service.registry().hosted_rooms("10.0.3.1"), 0);
    assert!(!service.registry().indexed(&peer.id));
    assert!(!service.registry().indexed(&waiting.id));

    // Ex-peers may start over on the same connection.
    let refreshed = service.create_room(&peer).unwrap();
    assert!(service.registry().contains(&refreshed.code));
}

#[test]
fn rejoin_after_disconnect_finds_no_room() {
    let service = service();

    let (host, _host_rx) = connect("10.0.4.1");
    let created = service.create_room(&host).unwrap();

    service.disconnect(&host);

    let (replacement, _rx) = connect("10.0.4.1");
    assert_eq!(
        service.rejoin_room(&replacement, &created.code, true, None),
        Err(Error::RoomNotFound)
    );
}

#[test]
fn rejoin_on_a_live_room_preserves_peers() {
    let service = service();

    let (host, _host_rx) = connect("10.0.5.1");
    let created = service.create_room(&host).unwrap();

    let (peer, mut peer_rx) = connect("10.0.5.2");
    service.join_room(&peer, &created.code, Some("Bob")).unwrap();
    service.approve_peer(&host, &peer.id, true).unwrap();
    recv(&mut peer_rx); // peer:approved

    // The client opened a replacement transport before the old one
    // dropped; the room must survive the old transport's disconnect.
    let (replacement, _replacement_rx) = connect("10.0.5.1");
    let rejoined = service
        .rejoin_room(&replacement, &created.code, true, None)
        .unwrap();

    assert_eq!(rejoined["success"], Value::Bool(true));
    assert_eq!(rejoined["peers"][0]["id"], Value::String(peer.id.clone()));
    assert_eq!(rejoined["peers"][0]["name"], Value::String("Bob".into()));

    match recv(&mut peer_rx) {
        Event::HostReconnected { host_id } => assert_eq!(host_id, replacement.id),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_idle(&mut peer_rx);

    service.disconnect(&host);

    assert!(service.registry().contains(&created.code));
    let members = service.registry().room_members(&created.code).unwrap();
    assert_eq!(members.host_id, replacement.id);
    assert_eq!(members.approved, vec![peer.id.clone()]);
    assert_eq!(service.registry().hosted_rooms("10.0.5.1"), 1);
    assert_idle(&mut peer_rx);

    // Signaling keeps working against the new host id.
    service
        .signal(&peer, &replacement.id, json!({"candidate": "c"}))
        .unwrap();
}

#[test]
fn pending_peer_may_not_signal() {
    let service = service();

    let (host, mut host_rx) = connect("10.0.6.1");
    let created = service.create_room(&host).unwrap();

    let (peer, _peer_rx) = connect("10.0.6.2");
    service.join_room(&peer, &created.code, None).unwrap();
    recv(&mut host_rx); // peer:request

    assert_eq!(
        service.signal(&peer, &host.id, json!({"sdp": "x"})),
        Err(Error::NotAuthorized)
    );
    assert_idle(&mut host_rx);

    // Pending peers are not valid targets either.
    assert_eq!(
        service.signal(&host, &peer.id, json!({"sdp": "x"})),
        Err(Error::TargetNotFound)
    );
}

#[test]
fn approval_requires_the_host() {
    let service = service();

    let (host, _host_rx) = connect("10.0.15.1");
    let created = service.create_room(&host).unwrap();

    let (peer, _peer_rx) = connect("10.0.15.2");
    service.join_room(&peer, &created.code, None).unwrap();

    // A peer cannot decide on itself, a stranger is in no room at all and
    // the host cannot approve an id that never asked.
    assert_eq!(
        service.approve_peer(&peer, &peer.id, true),
        Err(Error::NotAHost)
    );

    let (stranger, _stranger_rx) = connect("10.0.15.3");
    assert_eq!(
        service.approve_peer(&stranger, &peer.id, true),
        Err(Error::NotInRoom)
    );

    assert_eq!(
        service.approve_peer(&host, "no-such-peer", true),
        Err(Error::PeerNotPending)
    );

    // An approved peer cannot seize the host seat of its own room.
    service.approve_peer(&host, &peer.id, true).unwrap();
    assert_eq!(
        service.rejoin_room(&peer, &created.code, true, None),
        Err(Error::AlreadyInRoom)
    );
}

#[test]
fn one_room_per_connection() {
    let service = service();

    let (host, _host_rx) = connect("10.0.7.1");
    let created = service.create_room(&host).unwrap();

    assert_eq!(service.create_room(&host), Err(Error::AlreadyInRoom));

    let (other, _other_rx) = connect("10.0.7.2");
    let other_room = service.create_room(&other).unwrap();
    assert_eq!(
        service.join_room(&host, &other_room.code, None),
        Err(Error::AlreadyInRoom)
    );

    let (peer, _peer_rx) = connect("10.0.7.3");
    service.join_room(&peer, &created.code, None).unwrap();
    assert_eq!(
        service.join_room(&peer, &other_room.code, None),
        Err(Error::AlreadyInRoom)
    );
}

#[test]
fn hosting_is_capped_per_address() {
    let service = service();
    let registry = service.registry();

    let (first, _rx1) = connect("10.0.8.1");
    let (second, _rx2) = connect("10.0.8.1");
    let (third, _rx3) = connect("10.0.8.1");

    registry.create_room(&first, 2).unwrap();
    registry.create_room(&second, 2).unwrap();
    assert_eq!(registry.create_room(&third, 2), Err(Error::IpRoomCap(2)));

    // Another address is unaffected.
    let (elsewhere, _rx4) = connect("10.0.8.2");
    registry.create_room(&elsewhere, 2).unwrap();
}

#[test]
fn malformed_codes_are_rejected_before_lookup() {
    let service = service();

    let (peer, _rx) = connect("10.0.9.1");
    assert_eq!(
        service.join_room(&peer, "definitely not a code", None),
        Err(Error::InvalidCode)
    );
    assert_eq!(service.join_room(&peer, "abc-def", None), Err(Error::InvalidCode));

    // Well-shaped but never issued: fails the lookup, not the validation.
    assert_eq!(
        service.join_room(&peer, "abc-def-ghj", None),
        Err(Error::RoomNotFound)
    );
}

#[test]
fn sloppy_code_input_still_joins() {
    let service = service();

    let (host, _host_rx) = connect("10.0.10.1");
    let created = service.create_room(&host).unwrap();

    let sloppy = format!("  {}  ", created.code.replace('-', " ").to_uppercase());

    let (peer, _peer_rx) = connect("10.0.10.2");
    assert!(service.join_room(&peer, &sloppy, None).is_ok());
}

#[test]
fn oversized_payloads_are_refused() {
    let service = service();

    let (host, mut host_rx) = connect("10.0.11.1");
    let created = service.create_room(&host).unwrap();

    let (peer, _peer_rx) = connect("10.0.11.2");
    service.join_room(&peer, &created.code, None).unwrap();
    service.approve_peer(&host, &peer.id, true).unwrap();
    recv(&mut host_rx); // peer:request

    let oversized = json!({"sdp": "x".repeat(20_000)});
    assert_eq!(
        service.signal(&peer, &host.id, oversized),
        Err(Error::PayloadTooLarge)
    );
    assert_idle(&mut host_rx);
}

#[test]
fn signal_flood_is_limited_per_connection() {
    let service = service();

    let (host, mut host_rx) = connect("10.0.12.1");
    let created = service.create_room(&host).unwrap();

    let (peer, _peer_rx) = connect("10.0.12.2");
    service.join_room(&peer, &created.code, None).unwrap();
    service.approve_peer(&host, &peer.id, true).unwrap();
    recv(&mut host_rx); // peer:request

    for _ in 0..50 {
        service.signal(&peer, &host.id, json!({"c": 1})).unwrap();
    }
    assert_eq!(
        service.signal(&peer, &host.id, json!({"c": 1})),
        Err(Error::SignalRateLimited)
    );

    // The host's own budget is untouched.
    service.signal(&host, &peer.id, json!({"c": 2})).unwrap();
}

#[test]
fn fixed_window_resets_after_expiry() {
    let limiter = RateLimiter::new(Duration::from_millis(40), 3);

    for _ in 0..3 {
        assert!(limiter.allow("key"));
    }
    assert!(!limiter.allow("key"));
    assert_eq!(limiter.remaining("key"), 0);

    // One key's exhaustion never affects another's counter.
    assert!(limiter.allow("other"));
    assert_eq!(limiter.remaining("other"), 2);

    sleep(Duration::from_millis(60));

    assert_eq!(limiter.remaining("key"), 3);
    assert!(limiter.allow("key"));
}

#[test]
fn cleanup_drops_expired_buckets_only() {
    let limiter = RateLimiter::new(Duration::from_millis(30), 5);

    limiter.allow("stale");
    sleep(Duration::from_millis(50));
    limiter.allow("fresh");

    limiter.cleanup();

    assert_eq!(limiter.tracked_keys(), 1);
    assert_eq!(limiter.remaining("fresh"), 4);
}

#[test]
fn dispatch_speaks_the_wire_framing() {
    let service = service();
    let (handle, _rx) = connect("10.0.13.1");

    let reply: Value =
        serde_json::from_str(&service.dispatch(&handle, r#"{"id":7,"method":"getIceServers"}"#))
            .unwrap();
    assert_eq!(reply["id"], json!(7));
    assert_eq!(reply["result"]["iceServers"][0]["urls"], json!("stun:stun.l.google.com:19302"));

    let reply: Value = serde_json::from_str(
        &service.dispatch(&handle, r#"{"id":8,"method":"createRoom"}"#),
    )
    .unwrap();
    assert_eq!(reply["result"]["success"], json!(true));
    let room_code = reply["result"]["code"].as_str().unwrap().to_string();
    assert!(service.registry().contains(&room_code));

    // Domain errors ride the reply, never the transport.
    let reply: Value = serde_json::from_str(
        &service.dispatch(&handle, r#"{"id":9,"method":"joinRoom","params":{"code":"abc-def-ghj"}}"#),
    )
    .unwrap();
    assert_eq!(reply["id"], json!(9));
    assert_eq!(reply["result"]["error"], json!("Already in a room"));

    let reply: Value =
        serde_json::from_str(&service.dispatch(&handle, "this is not json")).unwrap();
    assert_eq!(reply["id"], json!(0));
    assert_eq!(reply["result"]["error"], json!("Bad request"));

    let reply: Value = serde_json::from_str(
        &service.dispatch(&handle, r#"{"id":10,"method":"selfDestruct"}"#),
    )
    .unwrap();
    assert_eq!(reply["result"]["error"], json!("Bad request"));
}

#[test]
fn peer_disconnect_notifies_the_host() {
    let service = service();

    let (host, mut host_rx) = connect("10.0.14.1");
    let created = service.create_room(&host).unwrap();

    let (peer, _peer_rx) = connect("10.0.14.2");
    service.join_room(&peer, &created.code, None).unwrap();
    service.approve_peer(&host, &peer.id, true).unwrap();
    recv(&mut host_rx); // peer:request

    service.disconnect(&peer);

    match recv(&mut host_rx) {
        Event::PeerDisconnected { peer_id } => assert_eq!(peer_id, peer.id),
        other => panic!("unexpected event: {other:?}"),
    }

    let members = service.registry().room_members(&created.code).unwrap();
    assert!(members.approved.is_empty());
    assert!(members.pending.is_empty());
    assert!(!service.registry().indexed(&peer.id));
    assert!(service.registry().contains(&created.code));
}
