//! MQTT 3.1.1 framing for `tokio_util::codec::Framed`.
//!
//! A frame is a fixed header byte, a variable-length "remaining length" and
//! the packet body. Decoding waits until the whole frame is buffered.

use std::num::NonZeroU16;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{
    Connect, ConnectReturnCode, LastWill, MQISDP, MQTT, MQTT_LEVEL_31, MQTT_LEVEL_311, Packet,
    Publish, QoS, SubscribeReturnCode, connect_flags, packet_type,
};
use crate::utils::error::{DecodeError, EncodeError};

macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Clone, Default)]
/// Mqtt v3.1.1 protocol codec
pub struct MqttCodec {
    max_size: u32,
}

impl MqttCodec {
    /// `max_packet_size` of `0` means unlimited.
    pub fn new(max_packet_size: u32) -> Self {
        Self {
            max_size: max_packet_size,
        }
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first_byte = src[0];
        let (remaining_length, consumed) = match decode_variable_length(&src[1..])? {
            Some(v) => v,
            None => return Ok(None),
        };
        if self.max_size != 0 && remaining_length > self.max_size {
            return Err(DecodeError::MaxSizeExceeded);
        }

        let frame_len = 1 + consumed + remaining_length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(1 + consumed);
        let body = src.split_to(remaining_length as usize).freeze();
        decode_packet(body, first_byte).map(Some)
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        if let Packet::Publish(Publish { qos, packet_id, .. }) = &item {
            if *qos != QoS::AtMostOnce && packet_id.is_none() {
                return Err(EncodeError::PacketIdRequired);
            }
        }

        let mut body = BytesMut::new();
        let first_byte = encode_body(&item, &mut body)?;
        ensure!(body.len() <= MAX_REMAINING_LENGTH, EncodeError::OverMaxPacketSize);

        dst.reserve(body.len() + 5);
        dst.put_u8(first_byte);
        encode_variable_length(body.len(), dst);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Returns `Ok(None)` when more bytes are needed to finish the length.
pub(crate) fn decode_variable_length(src: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut value: u32 = 0;
    for (i, byte) in src.iter().take(4).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= 4 {
        Err(DecodeError::MalformedPacket)
    } else {
        Ok(None)
    }
}

pub(crate) fn encode_variable_length(mut len: usize, dst: &mut BytesMut) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn decode_packet(mut src: Bytes, first_byte: u8) -> Result<Packet, DecodeError> {
    match first_byte {
        packet_type::CONNECT => decode_connect(&mut src),
        packet_type::CONNACK => {
            ensure!(src.remaining() == 2, DecodeError::InvalidLength);
            let session_present = src.get_u8() & 0x01 == 0x01;
            let return_code = ConnectReturnCode::try_from(src.get_u8())?;
            Ok(Packet::ConnectAck {
                session_present,
                return_code,
            })
        }
        packet_type::PUBLISH_START..=packet_type::PUBLISH_END => {
            decode_publish(&mut src, first_byte & 0b0000_1111)
        }
        packet_type::PUBACK => decode_ack(src, |packet_id| Packet::PublishAck { packet_id }),
        packet_type::PUBREC => decode_ack(src, |packet_id| Packet::PublishReceived { packet_id }),
        packet_type::PUBREL => decode_ack(src, |packet_id| Packet::PublishRelease { packet_id }),
        packet_type::PUBCOMP => decode_ack(src, |packet_id| Packet::PublishComplete { packet_id }),
        packet_type::SUBSCRIBE => decode_subscribe(&mut src),
        packet_type::SUBACK => {
            let packet_id = read_packet_id(&mut src)?;
            let status = src
                .iter()
                .map(|code| match *code {
                    0x80 => Ok(SubscribeReturnCode::Failure),
                    c => QoS::try_from(c).map(SubscribeReturnCode::Success),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Packet::SubscribeAck { packet_id, status })
        }
        packet_type::UNSUBSCRIBE => {
            let packet_id = read_packet_id(&mut src)?;
            let mut topic_filters = Vec::new();
            while src.has_remaining() {
                topic_filters.push(read_string(&mut src)?);
            }
            ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
            Ok(Packet::Unsubscribe {
                packet_id,
                topic_filters,
            })
        }
        packet_type::UNSUBACK => decode_ack(src, |packet_id| Packet::UnsubscribeAck { packet_id }),
        packet_type::PINGREQ => Ok(Packet::PingRequest),
        packet_type::PINGRESP => Ok(Packet::PingResponse),
        packet_type::DISCONNECT => Ok(Packet::Disconnect),
        _ => Err(DecodeError::UnsupportedPacketType),
    }
}

fn decode_ack(mut src: Bytes, f: impl Fn(NonZeroU16) -> Packet) -> Result<Packet, DecodeError> {
    let packet_id = read_packet_id(&mut src)?;
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(f(packet_id))
}

fn decode_connect(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let protocol = read_bytes(src)?;
    ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
    let level = src.get_u8();
    let name = protocol.as_ref();
    ensure!(name == MQTT || name == MQISDP, DecodeError::InvalidProtocol);
    ensure!(
        (name == MQTT && level == MQTT_LEVEL_311) || (name == MQISDP && level == MQTT_LEVEL_31),
        DecodeError::UnsupportedProtocolLevel
    );

    let flags = src.get_u8();
    ensure!(
        flags & connect_flags::RESERVED == 0,
        DecodeError::ConnectReservedFlagSet
    );
    let keep_alive = src.get_u16();
    let client_id = read_string(src)?;

    let last_will = if flags & connect_flags::WILL != 0 {
        let topic = read_string(src)?;
        let message = read_bytes(src)?;
        Some(LastWill {
            qos: QoS::try_from((flags & connect_flags::WILL_QOS) >> connect_flags::WILL_QOS_SHIFT)?,
            retain: flags & connect_flags::WILL_RETAIN != 0,
            topic,
            message,
        })
    } else {
        None
    };
    let username = if flags & connect_flags::USERNAME != 0 {
        Some(read_string(src)?)
    } else {
        None
    };
    let password = if flags & connect_flags::PASSWORD != 0 {
        Some(read_bytes(src)?)
    } else {
        None
    };

    Ok(Connect {
        protocol_level: level,
        clean_session: flags & connect_flags::CLEAN_SESSION != 0,
        keep_alive,
        client_id,
        last_will,
        username,
        password,
    }
    .into())
}

fn decode_publish(src: &mut Bytes, packet_flags: u8) -> Result<Packet, DecodeError> {
    let topic = read_string(src)?;
    let qos = QoS::try_from((packet_flags & 0b0110) >> 1)?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(read_packet_id(src)?)
    };

    Ok(Packet::Publish(Publish {
        dup: packet_flags & 0b1000 == 0b1000,
        retain: packet_flags & 0b0001 == 0b0001,
        qos,
        topic,
        packet_id,
        payload: src.split_off(0),
    }))
}

fn decode_subscribe(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = read_packet_id(src)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        let topic = read_string(src)?;
        ensure!(src.has_remaining(), DecodeError::InvalidLength);
        let qos = QoS::try_from(src.get_u8() & 0b0000_0011)?;
        topic_filters.push((topic, qos));
    }
    ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
    Ok(Packet::Subscribe {
        packet_id,
        topic_filters,
    })
}

fn read_packet_id(src: &mut Bytes) -> Result<NonZeroU16, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    NonZeroU16::new(src.get_u16()).ok_or(DecodeError::MalformedPacket)
}

fn read_bytes(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    let len = src.get_u16() as usize;
    ensure!(src.remaining() >= len, DecodeError::InvalidLength);
    Ok(src.split_to(len))
}

fn read_string(src: &mut Bytes) -> Result<String, DecodeError> {
    let raw = read_bytes(src)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Utf8Error)
}

fn write_bytes(data: &[u8], dst: &mut BytesMut) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::FieldTooLong)?;
    dst.put_u16(len);
    dst.extend_from_slice(data);
    Ok(())
}

/// Writes the variable header and payload into `body`, returning the fixed
/// header byte.
fn encode_body(packet: &Packet, body: &mut BytesMut) -> Result<u8, EncodeError> {
    let first_byte = match packet {
        Packet::Connect(connect) => {
            let protocol = if connect.protocol_level == MQTT_LEVEL_31 {
                MQISDP
            } else {
                MQTT
            };
            write_bytes(protocol, body)?;
            body.put_u8(connect.protocol_level);

            let mut flags = 0u8;
            if connect.clean_session {
                flags |= connect_flags::CLEAN_SESSION;
            }
            if let Some(will) = &connect.last_will {
                flags |= connect_flags::WILL;
                flags |= (will.qos as u8) << connect_flags::WILL_QOS_SHIFT;
                if will.retain {
                    flags |= connect_flags::WILL_RETAIN;
                }
            }
            if connect.username.is_some() {
                flags |= connect_flags::USERNAME;
            }
            if connect.password.is_some() {
                flags |= connect_flags::PASSWORD;
            }
            body.put_u8(flags);
            body.put_u16(connect.keep_alive);
            write_bytes(connect.client_id.as_bytes(), body)?;
            if let Some(will) = &connect.last_will {
                write_bytes(will.topic.as_bytes(), body)?;
                write_bytes(&will.message, body)?;
            }
            if let Some(username) = &connect.username {
                write_bytes(username.as_bytes(), body)?;
            }
            if let Some(password) = &connect.password {
                write_bytes(password, body)?;
            }
            packet_type::CONNECT
        }
        Packet::ConnectAck {
            session_present,
            return_code,
        } => {
            body.put_u8(u8::from(*session_present));
            body.put_u8(*return_code as u8);
            packet_type::CONNACK
        }
        Packet::Publish(publish) => {
            write_bytes(publish.topic.as_bytes(), body)?;
            if let Some(packet_id) = publish.packet_id {
                body.put_u16(packet_id.get());
            }
            body.extend_from_slice(&publish.payload);

            let mut flags = (publish.qos as u8) << 1;
            if publish.dup {
                flags |= 0b1000;
            }
            if publish.retain {
                flags |= 0b0001;
            }
            packet_type::PUBLISH_START | flags
        }
        Packet::PublishAck { packet_id } => {
            body.put_u16(packet_id.get());
            packet_type::PUBACK
        }
        Packet::PublishReceived { packet_id } => {
            body.put_u16(packet_id.get());
            packet_type::PUBREC
        }
        Packet::PublishRelease { packet_id } => {
            body.put_u16(packet_id.get());
            packet_type::PUBREL
        }
        Packet::PublishComplete { packet_id } => {
            body.put_u16(packet_id.get());
            packet_type::PUBCOMP
        }
        Packet::Subscribe {
            packet_id,
            topic_filters,
        } => {
            body.put_u16(packet_id.get());
            for (filter, qos) in topic_filters {
                write_bytes(filter.as_bytes(), body)?;
                body.put_u8(*qos as u8);
            }
            packet_type::SUBSCRIBE
        }
        Packet::SubscribeAck { packet_id, status } => {
            body.put_u16(packet_id.get());
            for code in status {
                body.put_u8(match code {
                    SubscribeReturnCode::Success(qos) => *qos as u8,
                    SubscribeReturnCode::Failure => 0x80,
                });
            }
            packet_type::SUBACK
        }
        Packet::Unsubscribe {
            packet_id,
            topic_filters,
        } => {
            body.put_u16(packet_id.get());
            for filter in topic_filters {
                write_bytes(filter.as_bytes(), body)?;
            }
            packet_type::UNSUBSCRIBE
        }
        Packet::UnsubscribeAck { packet_id } => {
            body.put_u16(packet_id.get());
            packet_type::UNSUBACK
        }
        Packet::PingRequest => packet_type::PINGREQ,
        Packet::PingResponse => packet_type::PINGRESP,
        Packet::Disconnect => packet_type::DISCONNECT,
    };
    Ok(first_byte)
}
