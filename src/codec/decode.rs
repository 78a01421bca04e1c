//! MQTT v3.1.1 packet decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolLevel, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription, UnsubAck,
    Unsubscribe, Will,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a whole packet is buffered, otherwise the
    /// packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Reject before buffering the body
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, payload),
            2 => self.decode_connack(flags, payload),
            3 => self.decode_publish(flags, payload),
            4 => decode_packet_id(flags, 0x00, payload).map(|id| Packet::PubAck(PubAck::new(id))),
            5 => decode_packet_id(flags, 0x00, payload).map(|id| Packet::PubRec(PubRec::new(id))),
            6 => decode_packet_id(flags, 0x02, payload).map(|id| Packet::PubRel(PubRel::new(id))),
            7 => {
                decode_packet_id(flags, 0x00, payload).map(|id| Packet::PubComp(PubComp::new(id)))
            }
            8 => self.decode_subscribe(flags, payload),
            9 => self.decode_suback(flags, payload),
            10 => self.decode_unsubscribe(flags, payload),
            11 => {
                decode_packet_id(flags, 0x00, payload).map(|id| Packet::UnsubAck(UnsubAck::new(id)))
            }
            12 => decode_empty(flags, payload, Packet::PingReq),
            13 => decode_empty(flags, payload, Packet::PingResp),
            14 => decode_empty(flags, payload, Packet::Disconnect),
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        }
        .map_err(|e| match e {
            // The body is complete, so running short inside it is malformed
            DecodeError::InsufficientData => DecodeError::MalformedPacket("truncated packet"),
            other => other,
        })?;

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;

        let (protocol_name, len) = read_string(payload)?;
        pos += len;

        let version_byte = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        let protocol_level = ProtocolLevel::from_u8(version_byte)
            .ok_or(DecodeError::InvalidProtocolVersion(version_byte))?;
        if protocol_name != protocol_level.protocol_name() {
            return Err(DecodeError::InvalidProtocolName);
        }

        let connect_flags = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // [MQTT-3.1.2-3] reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos_bits = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

        // [MQTT-3.1.2-13] [MQTT-3.1.2-15]
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = read_u16(&payload[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        let will = if will_flag {
            let (will_topic, len) = read_string(&payload[pos..])?;
            pos += len;

            let (will_payload, len) = read_binary(&payload[pos..])?;
            pos += len;

            Some(Will {
                topic: will_topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, len) = read_binary(&payload[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        if pos != payload.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes after CONNECT payload"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_level,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        let acknowledge_flags = payload[0];
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let return_code = ConnectReturnCode::from_u8(payload[1])
            .ok_or(DecodeError::MalformedPacket("unknown CONNACK return code"))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        // [MQTT-3.3.1-2]
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        let (topic, len) = read_string(payload)?;
        pos += len;

        // [MQTT-3.3.2-2]
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        // [MQTT-3.8.1-1]
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }

        let mut pos = 2;
        let mut subscriptions = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            let requested = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;

            // [MQTT-3.8.3-4] upper six bits reserved
            if (requested & 0xFC) != 0 {
                return Err(DecodeError::MalformedPacket("reserved bits set in requested QoS"));
            }
            let qos = QoS::from_u8(requested).ok_or(DecodeError::InvalidQoS(requested))?;

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        // [MQTT-3.8.3-3]
        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let return_codes = payload[2..]
            .iter()
            .map(|&code| {
                SubAckReturnCode::from_u8(code)
                    .ok_or(DecodeError::MalformedPacket("unknown SUBACK return code"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        // [MQTT-3.10.1-1]
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }

        let mut pos = 2;
        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            filters.push(filter.to_string());
        }

        // [MQTT-3.10.3-2]
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK: exactly a packet id
fn decode_packet_id(flags: u8, expected_flags: u8, payload: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("expected a 2 byte packet id"));
    }
    read_u16(payload)
}

/// PINGREQ, PINGRESP and DISCONNECT carry no variable header or payload
fn decode_empty(flags: u8, payload: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !payload.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected payload"));
    }
    Ok(packet)
}
