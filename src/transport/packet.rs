//! MQTT 3.1.1 control packets
//!
//! Only what the broker needs: both directions are modelled so the same
//! types serve the server loop and the test clients.

use std::num::NonZeroU16;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::utils::error::DecodeError;

pub(crate) mod packet_type {
    pub const CONNECT: u8 = 0x10;
    pub const CONNACK: u8 = 0x20;
    pub const PUBLISH_START: u8 = 0x30;
    pub const PUBLISH_END: u8 = 0x3F;
    pub const PUBACK: u8 = 0x40;
    pub const PUBREC: u8 = 0x50;
    pub const PUBREL: u8 = 0x62;
    pub const PUBCOMP: u8 = 0x70;
    pub const SUBSCRIBE: u8 = 0x82;
    pub const SUBACK: u8 = 0x90;
    pub const UNSUBSCRIBE: u8 = 0xA2;
    pub const UNSUBACK: u8 = 0xB0;
    pub const PINGREQ: u8 = 0xC0;
    pub const PINGRESP: u8 = 0xD0;
    pub const DISCONNECT: u8 = 0xE0;
}

pub(crate) mod connect_flags {
    pub const USERNAME: u8 = 0b1000_0000;
    pub const PASSWORD: u8 = 0b0100_0000;
    pub const WILL_RETAIN: u8 = 0b0010_0000;
    pub const WILL_QOS: u8 = 0b0001_1000;
    pub const WILL: u8 = 0b0000_0100;
    pub const CLEAN_SESSION: u8 = 0b0000_0010;
    pub const RESERVED: u8 = 0b0000_0001;
    pub const WILL_QOS_SHIFT: u8 = 3;
}

pub const MQTT: &[u8] = b"MQTT";
pub const MQISDP: &[u8] = b"MQIsdp";
pub const MQTT_LEVEL_31: u8 = 3;
pub const MQTT_LEVEL_311: u8 = 4;

/// Delivery quality level. Ordered, so `min` gives the effective level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(DecodeError::MalformedPacket),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub message: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub last_will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServiceUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServiceUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            _ => Err(DecodeError::MalformedPacket),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: String,
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck {
        session_present: bool,
        return_code: ConnectReturnCode,
    },
    Publish(Publish),
    PublishAck {
        packet_id: NonZeroU16,
    },
    PublishReceived {
        packet_id: NonZeroU16,
    },
    PublishRelease {
        packet_id: NonZeroU16,
    },
    PublishComplete {
        packet_id: NonZeroU16,
    },
    Subscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<(String, QoS)>,
    },
    SubscribeAck {
        packet_id: NonZeroU16,
        status: Vec<SubscribeReturnCode>,
    },
    Unsubscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<String>,
    },
    UnsubscribeAck {
        packet_id: NonZeroU16,
    },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(c: Connect) -> Self {
        Packet::Connect(Box::new(c))
    }
}

impl From<Publish> for Packet {
    fn from(p: Publish) -> Self {
        Packet::Publish(p)
    }
}
