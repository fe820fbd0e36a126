use super::session::{ClientSession, DeliveryStatus};
use crate::transport::packet::{Packet, QoS};
use tokio::sync::mpsc;

#[test]
fn test_session_new() {
    let (tx, _rx) = mpsc::channel::<Packet>(4);
    let session = ClientSession::new("alice-phone", tx);
    assert_eq!(session.client_id(), "alice-phone");
    assert!(session.subscriptions.is_empty());
    assert!(!session.is_closed());
}

#[test]
fn test_resubscribe_replaces_qos() {
    let (tx, _rx) = mpsc::channel::<Packet>(4);
    let mut session = ClientSession::new("c1", tx);
    session.subscribe("owntracks/#", QoS::AtMostOnce);
    session.subscribe("owntracks/#", QoS::AtLeastOnce);
    assert_eq!(session.subscriptions.len(), 1);
    assert_eq!(
        session.matching_qos("owntracks/a/b"),
        Some(QoS::AtLeastOnce)
    );
}

#[test]
fn test_matching_qos_takes_highest_overlap() {
    let (tx, _rx) = mpsc::channel::<Packet>(4);
    let mut session = ClientSession::new("c1", tx);
    session.subscribe("owntracks/+/+", QoS::AtMostOnce);
    session.subscribe("owntracks/alice/#", QoS::ExactlyOnce);
    assert_eq!(
        session.matching_qos("owntracks/alice/phone"),
        Some(QoS::ExactlyOnce)
    );
    assert_eq!(
        session.matching_qos("owntracks/bob/phone"),
        Some(QoS::AtMostOnce)
    );
    assert_eq!(session.matching_qos("other/bob/phone"), None);
}

#[test]
fn test_send_reports_full_and_closed() {
    let (tx, rx) = mpsc::channel::<Packet>(1);
    let mut session = ClientSession::new("c1", tx);

    assert_eq!(session.send(Packet::PingResponse), DeliveryStatus::Queued);
    assert_eq!(session.send(Packet::PingResponse), DeliveryStatus::Full);
    assert_eq!(session.send(Packet::PingResponse), DeliveryStatus::Full);
    assert_eq!(session.full_strikes(), 2);

    drop(rx);
    assert_eq!(session.send(Packet::PingResponse), DeliveryStatus::Closed);
    assert!(session.is_closed());
}

#[test]
fn test_packet_ids_skip_inflight() {
    let (tx, _rx) = mpsc::channel::<Packet>(1);
    let mut session = ClientSession::new("c1", tx);
    let first = session.next_packet_id().unwrap();
    assert_eq!(first.get(), 1);
    session.inflight.insert(
        std::num::NonZeroU16::new(2).unwrap(),
        super::InflightMessage {
            publish: crate::transport::packet::Publish {
                dup: false,
                retain: false,
                qos: QoS::AtLeastOnce,
                topic: "t".into(),
                packet_id: std::num::NonZeroU16::new(2),
                payload: bytes::Bytes::new(),
            },
            sent_at: 0,
            retries: 0,
        },
    );
    assert_eq!(session.next_packet_id().unwrap().get(), 3);
}

fn inflight(id: std::num::NonZeroU16) -> super::InflightMessage {
    super::InflightMessage {
        publish: crate::transport::packet::Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: "t".into(),
            packet_id: Some(id),
            payload: bytes::Bytes::new(),
        },
        sent_at: 0,
        retries: 0,
    }
}

#[test]
fn test_packet_ids_exhausted_returns_none() {
    let (tx, _rx) = mpsc::channel::<Packet>(1);
    let mut session = ClientSession::new("c1", tx);
    for id in 1..=u16::MAX {
        let id = std::num::NonZeroU16::new(id).unwrap();
        session.inflight.insert(id, inflight(id));
    }
    assert_eq!(session.next_packet_id(), None);

    // acking any one id frees it again
    let freed = std::num::NonZeroU16::new(4242).unwrap();
    session.inflight.remove(&freed);
    assert_eq!(session.next_packet_id(), Some(freed));
}

#[test]
fn test_close_cancels_token() {
    let (tx, _rx) = mpsc::channel::<Packet>(1);
    let session = ClientSession::new("c1", tx);
    let token = session.shutdown_token();
    session.close();
    assert!(token.is_cancelled());
}
