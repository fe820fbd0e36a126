use super::engine::{Broker, Credentials, DisconnectReason, Origin, SUPPORTED_QOS};
use super::message::Message;
use super::topic::{is_valid_pattern, is_valid_topic, matches};
use crate::client::SessionHandle;
use crate::config::BrokerSettings;
use crate::transport::packet::{
    Connect, LastWill, Packet, Publish, QoS, SubscribeReturnCode,
};
use crate::utils::error::AuthError;
use bytes::Bytes;
use std::num::NonZeroU16;
use tokio::sync::mpsc;

fn connect_packet(client_id: &str) -> Connect {
    Connect {
        protocol_level: 4,
        clean_session: true,
        keep_alive: 60,
        client_id: client_id.to_string(),
        last_will: None,
        username: None,
        password: None,
    }
}

fn publish(topic: &str, payload: &'static str, qos: QoS, packet_id: Option<u16>) -> Publish {
    Publish {
        dup: false,
        retain: false,
        qos,
        topic: topic.to_string(),
        packet_id: packet_id.and_then(NonZeroU16::new),
        payload: Bytes::from_static(payload.as_bytes()),
    }
}

fn join(broker: &mut Broker, client_id: &str, queue: usize) -> (SessionHandle, mpsc::Receiver<Packet>) {
    let (tx, rx) = mpsc::channel(queue);
    let (handle, _token) = broker
        .connect(&connect_packet(client_id), tx)
        .expect("connect");
    (handle, rx)
}

fn drain(rx: &mut mpsc::Receiver<Packet>) -> Vec<Packet> {
    let mut out = Vec::new();
    while let Ok(p) = rx.try_recv() {
        out.push(p);
    }
    out
}

fn publishes(rx: &mut mpsc::Receiver<Packet>) -> Vec<Publish> {
    drain(rx)
        .into_iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => Some(p),
            _ => None,
        })
        .collect()
}

#[test]
fn test_single_level_wildcard() {
    assert!(matches("a/+/c", "a/b/c"));
    assert!(!matches("a/+/c", "a/b/c/d"));
    assert!(!matches("a/+/c", "a/c"));
    assert!(matches("+", "a"));
    assert!(!matches("+", "a/b"));
}

#[test]
fn test_multi_level_wildcard() {
    assert!(matches("a/#", "a"));
    assert!(matches("a/#", "a/b"));
    assert!(matches("a/#", "a/b/c"));
    assert!(matches("#", "a/b"));
    assert!(!matches("a/#", "b/a"));
}

#[test]
fn test_literal_matching_is_exact() {
    assert!(matches("owntracks/alice/phone", "owntracks/alice/phone"));
    assert!(!matches("owntracks/alice/phone", "owntracks/Alice/phone"));
    assert!(!matches("owntracks/alice", "owntracks/alice/phone"));
    assert!(!matches("owntracks/alice/phone", "owntracks/alice"));
}

#[test]
fn test_pattern_validation() {
    assert!(is_valid_pattern("a/+/c"));
    assert!(is_valid_pattern("a/#"));
    assert!(is_valid_pattern("#"));
    assert!(!is_valid_pattern("a/#/c"));
    assert!(!is_valid_pattern("a/b#"));
    assert!(!is_valid_pattern("a+/b"));
    assert!(!is_valid_pattern(""));
    assert!(!matches("a/#/c", "a/b/c"));

    assert!(is_valid_topic("a/b"));
    assert!(!is_valid_topic("a/+"));
    assert!(!is_valid_topic(""));
}

#[test]
fn test_connect_without_credentials() {
    let mut broker = Broker::default();
    let (handle, _rx) = join(&mut broker, "alice", 8);
    assert_eq!(handle.client_id, "alice");
    assert_eq!(broker.session_count(), 1);
}

#[test]
fn test_connect_checks_credentials() {
    let creds = Credentials {
        username: "owner".into(),
        password: "pw".into(),
    };
    let mut broker = Broker::new(BrokerSettings::default(), Some(creds));

    let (tx, _rx) = mpsc::channel(1);
    let err = broker.connect(&connect_packet("a"), tx).unwrap_err();
    assert_eq!(err, AuthError::BadCredentials);

    let mut req = connect_packet("a");
    req.username = Some("owner".into());
    req.password = Some(Bytes::from_static(b"wrong"));
    let (tx, _rx) = mpsc::channel(1);
    assert_eq!(broker.connect(&req, tx).unwrap_err(), AuthError::BadCredentials);

    req.password = Some(Bytes::from_static(b"pw"));
    let (tx, _rx) = mpsc::channel(1);
    assert!(broker.connect(&req, tx).is_ok());
}

#[test]
fn test_connect_assigns_id_to_empty_client_id() {
    let mut broker = Broker::default();
    let (handle, _rx) = join(&mut broker, "", 1);
    assert!(handle.client_id.starts_with("auto-"));

    let mut req = connect_packet("");
    req.clean_session = false;
    let (tx, _rx) = mpsc::channel(1);
    assert_eq!(broker.connect(&req, tx).unwrap_err(), AuthError::InvalidClientId);
}

#[test]
fn test_connect_enforces_connection_limit() {
    let settings = BrokerSettings {
        max_connections: 1,
        ..BrokerSettings::default()
    };
    let mut broker = Broker::new(settings, None);
    let (_a, _rx) = join(&mut broker, "a", 1);
    let (tx, _rx2) = mpsc::channel(1);
    assert_eq!(
        broker.connect(&connect_packet("b"), tx).unwrap_err(),
        AuthError::ServerFull(1)
    );
    // reconnecting an existing id is still allowed
    let (tx, _rx3) = mpsc::channel(1);
    assert!(broker.connect(&connect_packet("a"), tx).is_ok());
}

#[test]
fn test_reconnect_supersedes_previous_session() {
    let mut broker = Broker::default();
    let (tx, _rx) = mpsc::channel(1);
    let mut req = connect_packet("alice");
    req.last_will = Some(LastWill {
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "owntracks/alice/alice".into(),
        message: Bytes::from_static(b"{\"_type\":\"lwt\"}"),
    });
    let (old, old_token) = broker.connect(&req, tx).unwrap();

    let (watcher, mut watcher_rx) = join(&mut broker, "watcher", 8);
    broker.subscribe(&watcher, "owntracks/#", QoS::AtMostOnce);

    let (new, _rx2) = join(&mut broker, "alice", 8);
    assert!(old_token.is_cancelled());
    assert_ne!(old.session_id, new.session_id);
    assert_eq!(broker.session_count(), 2);

    // the stale handle cannot remove the new session, and no will went out
    assert!(!broker.disconnect(&old, DisconnectReason::Transport));
    assert!(broker.session("alice").is_some());
    assert!(publishes(&mut watcher_rx).is_empty());
}

#[test]
fn test_subscribe_grants_min_qos() {
    let mut broker = Broker::default();
    let (h, _rx) = join(&mut broker, "a", 8);
    assert_eq!(
        broker.subscribe(&h, "x/#", QoS::AtLeastOnce),
        SubscribeReturnCode::Success(QoS::AtLeastOnce)
    );
    assert_eq!(
        broker.subscribe(&h, "y/#", QoS::ExactlyOnce),
        SubscribeReturnCode::Success(SUPPORTED_QOS)
    );
    assert_eq!(
        broker.subscribe(&h, "x/#/z", QoS::AtMostOnce),
        SubscribeReturnCode::Failure
    );
}

#[test]
fn test_publish_delivers_only_to_matching_sessions() {
    let mut broker = Broker::default();
    let (a, mut rx_a) = join(&mut broker, "a", 8);
    let (b, mut rx_b) = join(&mut broker, "b", 8);
    broker.subscribe(&a, "a/+/c", QoS::AtMostOnce);
    broker.subscribe(&b, "a/#", QoS::AtMostOnce);

    broker.publish(publish("a/b/c/d", "deep", QoS::AtMostOnce, None), Origin::Internal);

    assert!(publishes(&mut rx_a).is_empty());
    let got = publishes(&mut rx_b);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, Bytes::from_static(b"deep"));
}

#[test]
fn test_publish_reaches_originating_session() {
    let mut broker = Broker::default();
    let (a, mut rx) = join(&mut broker, "a", 8);
    broker.subscribe(&a, "owntracks/#", QoS::AtMostOnce);
    broker.publish(
        publish("owntracks/a/a", "{}", QoS::AtMostOnce, None),
        Origin::Client(a.clone()),
    );
    assert_eq!(publishes(&mut rx).len(), 1);
}

#[test]
fn test_overlapping_patterns_deliver_once() {
    let mut broker = Broker::default();
    let (a, mut rx) = join(&mut broker, "a", 8);
    broker.subscribe(&a, "owntracks/#", QoS::AtMostOnce);
    broker.subscribe(&a, "owntracks/+/+", QoS::AtLeastOnce);
    broker.subscribe(&a, "owntracks/+/+", QoS::AtLeastOnce);

    broker.publish(publish("owntracks/b/b", "x", QoS::AtLeastOnce, None), Origin::Internal);

    let got = publishes(&mut rx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].qos, QoS::AtLeastOnce);
    assert!(got[0].packet_id.is_some());
}

#[test]
fn test_delivery_preserves_publish_order() {
    let mut broker = Broker::default();
    let (a, mut rx) = join(&mut broker, "a", 16);
    broker.subscribe(&a, "t", QoS::AtMostOnce);
    for body in ["1", "2", "3"] {
        broker.publish(publish("t", body, QoS::AtMostOnce, None), Origin::Internal);
    }
    let got: Vec<_> = publishes(&mut rx).into_iter().map(|p| p.payload).collect();
    assert_eq!(
        got,
        vec![
            Bytes::from_static(b"1"),
            Bytes::from_static(b"2"),
            Bytes::from_static(b"3")
        ]
    );
}

#[test]
fn test_qos1_publish_is_acked_and_tracked() {
    let mut broker = Broker::default();
    let (pubr, mut pub_rx) = join(&mut broker, "pub", 8);
    let (sub, mut sub_rx) = join(&mut broker, "sub", 8);
    broker.subscribe(&sub, "t", QoS::AtLeastOnce);

    broker.publish(publish("t", "m", QoS::AtLeastOnce, Some(7)), Origin::Client(pubr));

    let acks = drain(&mut pub_rx);
    assert_eq!(
        acks,
        vec![Packet::PublishAck {
            packet_id: NonZeroU16::new(7).unwrap()
        }]
    );

    let delivered = publishes(&mut sub_rx);
    let id = delivered[0].packet_id.expect("packet id");
    assert_eq!(broker.session("sub").unwrap().inflight.len(), 1);
    assert!(broker.handle_ack(&sub, id));
    assert!(broker.session("sub").unwrap().inflight.is_empty());
    assert!(!broker.handle_ack(&sub, id));
}

#[test]
fn test_qos2_publish_gets_receipt() {
    let mut broker = Broker::default();
    let (pubr, mut rx) = join(&mut broker, "pub", 8);
    broker.publish(publish("t", "m", QoS::ExactlyOnce, Some(3)), Origin::Client(pubr));
    assert_eq!(
        drain(&mut rx),
        vec![Packet::PublishReceived {
            packet_id: NonZeroU16::new(3).unwrap()
        }]
    );
}

#[test]
fn test_pubrec_from_subscriber_releases() {
    let mut broker = Broker::default();
    let (sub, mut rx) = join(&mut broker, "sub", 8);
    broker.subscribe(&sub, "t", QoS::ExactlyOnce);
    broker.publish(publish("t", "m", QoS::ExactlyOnce, None), Origin::Internal);
    let id = publishes(&mut rx)[0].packet_id.unwrap();

    broker.handle_received(&sub, id);
    assert_eq!(drain(&mut rx), vec![Packet::PublishRelease { packet_id: id }]);
    assert!(broker.session("sub").unwrap().inflight.is_empty());
}

#[test]
fn test_retry_resends_with_dup_then_drops() {
    let settings = BrokerSettings {
        ack_timeout_ms: 100,
        max_retries: 2,
        ..BrokerSettings::default()
    };
    let mut broker = Broker::new(settings, None);
    let (sub, mut rx) = join(&mut broker, "sub", 16);
    broker.subscribe(&sub, "t", QoS::AtLeastOnce);
    broker.publish(publish("t", "m", QoS::AtLeastOnce, None), Origin::Internal);
    let first = publishes(&mut rx);
    assert!(!first[0].dup);

    let sent_at = broker.session("sub").unwrap().inflight.values().next().unwrap().sent_at;

    broker.retry_pending(sent_at + 50);
    assert!(publishes(&mut rx).is_empty());

    broker.retry_pending(sent_at + 100);
    let again = publishes(&mut rx);
    assert_eq!(again.len(), 1);
    assert!(again[0].dup);
    assert_eq!(again[0].packet_id, first[0].packet_id);

    broker.retry_pending(sent_at + 200);
    assert_eq!(publishes(&mut rx).len(), 1);

    broker.retry_pending(sent_at + 300);
    assert!(publishes(&mut rx).is_empty());
    assert!(broker.session("sub").unwrap().inflight.is_empty());
}

#[test]
fn test_persistently_full_queue_disconnects() {
    let settings = BrokerSettings {
        max_queue_strikes: 2,
        ..BrokerSettings::default()
    };
    let mut broker = Broker::new(settings, None);
    let (slow, _rx) = join(&mut broker, "slow", 1);
    broker.subscribe(&slow, "t", QoS::AtMostOnce);
    let (tx, _fast_rx) = mpsc::channel(16);
    let (_fast, _) = broker.connect(&connect_packet("fast"), tx).unwrap();

    broker.publish(publish("t", "1", QoS::AtMostOnce, None), Origin::Internal);
    broker.publish(publish("t", "2", QoS::AtMostOnce, None), Origin::Internal);
    assert!(broker.session("slow").is_some());
    broker.publish(publish("t", "3", QoS::AtMostOnce, None), Origin::Internal);
    assert!(broker.session("slow").is_none());
    assert!(broker.session("fast").is_some());
}

#[test]
fn test_closed_receiver_disconnects_on_publish() {
    let mut broker = Broker::default();
    let (a, rx) = join(&mut broker, "a", 4);
    broker.subscribe(&a, "t", QoS::AtMostOnce);
    drop(rx);
    broker.publish(publish("t", "m", QoS::AtMostOnce, None), Origin::Internal);
    assert!(broker.session("a").is_none());
}

#[test]
fn test_disconnect_publishes_will_and_ingests_it() {
    let mut broker = Broker::default();
    let (ingest_tx, mut ingest_rx) = mpsc::channel::<Message>(16);
    broker.set_ingest(ingest_tx);

    let mut req = connect_packet("alice");
    req.last_will = Some(LastWill {
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "owntracks/alice/alice".into(),
        message: Bytes::from_static(b"{\"_type\":\"lwt\",\"tst\":1}"),
    });
    let (tx, _rx) = mpsc::channel(4);
    let (alice, _) = broker.connect(&req, tx).unwrap();

    let (watcher, mut watch_rx) = join(&mut broker, "watcher", 8);
    broker.subscribe(&watcher, "owntracks/#", QoS::AtMostOnce);

    assert!(broker.disconnect(&alice, DisconnectReason::Client));
    assert!(broker.session("alice").is_none());

    let seen = publishes(&mut watch_rx);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].topic, "owntracks/alice/alice");

    let ingested = ingest_rx.try_recv().expect("will ingested");
    assert_eq!(ingested.client_id.as_deref(), Some("alice"));
    assert_eq!(ingested.topic, "owntracks/alice/alice");
}

#[test]
fn test_ingest_skips_internal_publishes() {
    let mut broker = Broker::default();
    let (ingest_tx, mut ingest_rx) = mpsc::channel::<Message>(16);
    broker.set_ingest(ingest_tx);
    let (a, _rx) = join(&mut broker, "a", 4);

    broker.publish(publish("owntracks/a/a", "x", QoS::AtMostOnce, None), Origin::Internal);
    assert!(ingest_rx.try_recv().is_err());

    broker.publish(publish("owntracks/a/a", "y", QoS::AtMostOnce, None), Origin::Client(a));
    let msg = ingest_rx.try_recv().expect("client publish ingested");
    assert_eq!(msg.payload, Bytes::from_static(b"y"));
    assert_eq!(msg.client_id.as_deref(), Some("a"));
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let mut broker = Broker::default();
    let (a, mut rx) = join(&mut broker, "a", 4);
    broker.subscribe(&a, "t/#", QoS::AtMostOnce);
    assert!(broker.unsubscribe(&a, "t/#"));
    assert!(!broker.unsubscribe(&a, "t/#"));
    broker.publish(publish("t/x", "m", QoS::AtMostOnce, None), Origin::Internal);
    assert!(publishes(&mut rx).is_empty());
}

#[test]
fn test_exhausted_packet_ids_fall_back_to_qos0() {
    let mut broker = Broker::default();
    let (a, mut rx) = join(&mut broker, "a", 70_000);
    broker.subscribe(&a, "t", QoS::AtLeastOnce);

    // read but never acknowledged
    for _ in 0..u16::MAX {
        broker.publish(publish("t", "old", QoS::AtLeastOnce, None), Origin::Internal);
    }
    assert_eq!(drain(&mut rx).len(), usize::from(u16::MAX));
    assert_eq!(broker.session("a").unwrap().inflight.len(), usize::from(u16::MAX));

    broker.publish(publish("t", "new", QoS::AtLeastOnce, None), Origin::Internal);
    let got = publishes(&mut rx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].qos, QoS::AtMostOnce);
    assert_eq!(got[0].packet_id, None);
    assert_eq!(broker.session("a").unwrap().inflight.len(), usize::from(u16::MAX));
    assert!(broker.session("a").is_some());
}

#[test]
fn test_willless_transport_drop_ingests_lwt() {
    let mut broker = Broker::default();
    let (ingest_tx, mut ingest_rx) = mpsc::channel::<Message>(16);
    broker.set_ingest(ingest_tx);
    let (alice, _rx) = join(&mut broker, "alice", 4);
    let (watcher, mut watch_rx) = join(&mut broker, "watcher", 8);
    broker.subscribe(&watcher, "owntracks/#", QoS::AtMostOnce);

    broker.publish(
        publish("owntracks/alice/phone", "{}", QoS::AtMostOnce, None),
        Origin::Client(alice.clone()),
    );
    broker.publish(
        publish("owntracks/alice/phone/event", "{}", QoS::AtMostOnce, None),
        Origin::Client(alice.clone()),
    );
    broker.publish(
        publish("elsewhere/alice/phone", "{}", QoS::AtMostOnce, None),
        Origin::Client(alice.clone()),
    );
    while ingest_rx.try_recv().is_ok() {}
    drain(&mut watch_rx);

    assert!(broker.disconnect(&alice, DisconnectReason::Transport));

    let lwt = ingest_rx.try_recv().expect("lwt ingested");
    assert_eq!(lwt.topic, "owntracks/alice/phone");
    assert_eq!(lwt.client_id.as_deref(), Some("alice"));
    let v: serde_json::Value = serde_json::from_slice(&lwt.payload).unwrap();
    assert_eq!(v["_type"], "lwt");
    assert!(ingest_rx.try_recv().is_err());

    // ingest only; subscribers see nothing
    assert!(publishes(&mut watch_rx).is_empty());
}

#[test]
fn test_superseded_session_ingests_no_lwt() {
    let mut broker = Broker::default();
    let (ingest_tx, mut ingest_rx) = mpsc::channel::<Message>(16);
    broker.set_ingest(ingest_tx);
    let (alice, _rx) = join(&mut broker, "alice", 4);
    broker.publish(
        publish("owntracks/alice/phone", "{}", QoS::AtMostOnce, None),
        Origin::Client(alice),
    );
    while ingest_rx.try_recv().is_ok() {}

    let (_again, _rx2) = join(&mut broker, "alice", 4);
    assert!(ingest_rx.try_recv().is_err());
}

#[test]
fn test_full_ingest_queue_drops_and_counts() {
    let mut broker = Broker::default();
    let (ingest_tx, mut ingest_rx) = mpsc::channel::<Message>(1);
    broker.set_ingest(ingest_tx);
    let (a, mut rx) = join(&mut broker, "a", 8);
    broker.subscribe(&a, "owntracks/#", QoS::AtMostOnce);

    broker.publish(publish("owntracks/a/a", "1", QoS::AtMostOnce, None), Origin::Client(a.clone()));
    broker.publish(publish("owntracks/a/a", "2", QoS::AtMostOnce, None), Origin::Client(a));
    assert_eq!(broker.ingest_dropped(), 1);

    // the first stays queued, and fan-out is unaffected
    assert_eq!(ingest_rx.try_recv().unwrap().payload, Bytes::from_static(b"1"));
    assert!(ingest_rx.try_recv().is_err());
    assert_eq!(publishes(&mut rx).len(), 2);
}
