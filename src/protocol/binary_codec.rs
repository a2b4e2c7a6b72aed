//! Compact binary wire format.
//!
//! ```ascii
//! 0: CRC-32/ISCSI checksum of the rest of the frame, starting after the checksum (u32 BE)
//! 4: format version (u8), currently 1
//! 5: frame kind (u8), see [FrameKind]
//! 6: frame specific fields
//! ```
//!
//! Integers are varint encoded (signed ones zigzag), strings and byte strings are prefixed by
//!  their varint length, optional fields by a marker byte (0 absent, 1 present). Application
//!  payloads (`data`) are carried as length-prefixed JSON with the empty string standing for
//!  `null`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use crc::{Crc, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_json::Value;

use crate::error::{Error, ErrorInfo, Result};
use crate::protocol::codec::Codec;
use crate::protocol::{ConnectionDetails, Message, PresenceAction, PresenceMessage, ProtocolMessage};
use crate::util::buf::*;

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 6;
const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FLAG_RESUMED: u8 = 1;
const FLAG_HAS_PRESENCE: u8 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum FrameKind {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connected = 4,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
}

pub struct BinaryCodec {}

impl Codec for BinaryCodec {
    fn encode(&self, msg: &ProtocolMessage) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u8(FORMAT_VERSION);
        ser_frame(msg, &mut buf)?;

        let checksum = CHECKSUM.checksum(&buf[4..]);
        buf[..4].copy_from_slice(&checksum.to_be_bytes());
        Ok(buf.freeze())
    }

    fn decode(&self, buf: &[u8]) -> Result<ProtocolMessage> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Decode(format!("frame of {} bytes is shorter than the header", buf.len())));
        }

        let mut parse_buf = buf;
        let expected_checksum = try_get_fixed_u32(&mut parse_buf)?;
        if CHECKSUM.checksum(parse_buf) != expected_checksum {
            return Err(Error::Decode("checksum mismatch".to_string()));
        }

        let version = try_get_byte(&mut parse_buf)?;
        if version != FORMAT_VERSION {
            return Err(Error::Decode(format!("unsupported format version {}", version)));
        }

        let msg = deser_frame(&mut parse_buf)?;
        if parse_buf.has_remaining() {
            return Err(Error::Decode(format!("{} trailing bytes after {} frame", parse_buf.remaining(), msg.kind())));
        }
        Ok(msg)
    }
}

fn ser_frame(msg: &ProtocolMessage, buf: &mut BytesMut) -> Result<()> {
    match msg {
        ProtocolMessage::Heartbeat { id } => {
            buf.put_u8(FrameKind::Heartbeat.into());
            put_opt_string(buf, id.as_deref());
        }
        ProtocolMessage::Ack { msg_serial, count } => {
            buf.put_u8(FrameKind::Ack.into());
            buf.put_u64_varint(*msg_serial);
            buf.put_u32_varint(*count);
        }
        ProtocolMessage::Nack { msg_serial, count, error } => {
            buf.put_u8(FrameKind::Nack.into());
            buf.put_u64_varint(*msg_serial);
            buf.put_u32_varint(*count);
            ser_opt_error(error.as_ref(), buf);
        }
        ProtocolMessage::Connected { connection_id, connection_key, connection_serial, details, error } => {
            buf.put_u8(FrameKind::Connected.into());
            put_string(buf, connection_id);
            put_string(buf, connection_key);
            buf.put_i64_varint(*connection_serial);
            put_opt_string(buf, details.client_id.as_deref());
            buf.put_u64_varint(details.max_idle_interval_ms);
            put_opt_varint_u64(buf, details.connection_state_ttl_ms);
            ser_opt_error(error.as_ref(), buf);
        }
        ProtocolMessage::Disconnected { error } => {
            buf.put_u8(FrameKind::Disconnected.into());
            ser_opt_error(error.as_ref(), buf);
        }
        ProtocolMessage::Close => buf.put_u8(FrameKind::Close.into()),
        ProtocolMessage::Closed => buf.put_u8(FrameKind::Closed.into()),
        ProtocolMessage::Error { channel, error } => {
            buf.put_u8(FrameKind::Error.into());
            put_opt_string(buf, channel.as_deref());
            ser_error(error, buf);
        }
        ProtocolMessage::Attach { channel } => {
            buf.put_u8(FrameKind::Attach.into());
            put_string(buf, channel);
        }
        ProtocolMessage::Attached { channel, resumed, has_presence, error } => {
            buf.put_u8(FrameKind::Attached.into());
            put_string(buf, channel);
            let mut flags = 0u8;
            if *resumed {
                flags |= FLAG_RESUMED;
            }
            if *has_presence {
                flags |= FLAG_HAS_PRESENCE;
            }
            buf.put_u8(flags);
            ser_opt_error(error.as_ref(), buf);
        }
        ProtocolMessage::Detach { channel } => {
            buf.put_u8(FrameKind::Detach.into());
            put_string(buf, channel);
        }
        ProtocolMessage::Detached { channel, error } => {
            buf.put_u8(FrameKind::Detached.into());
            put_string(buf, channel);
            ser_opt_error(error.as_ref(), buf);
        }
        ProtocolMessage::Message { channel, msg_serial, connection_serial, messages } => {
            buf.put_u8(FrameKind::Message.into());
            put_string(buf, channel);
            put_opt_varint_u64(buf, *msg_serial);
            put_opt_varint_i64(buf, *connection_serial);
            buf.put_usize_varint(messages.len());
            for m in messages {
                ser_message(m, buf)?;
            }
        }
        ProtocolMessage::Presence { channel, msg_serial, connection_serial, presence } => {
            buf.put_u8(FrameKind::Presence.into());
            put_string(buf, channel);
            put_opt_varint_u64(buf, *msg_serial);
            put_opt_varint_i64(buf, *connection_serial);
            ser_presence_list(presence, buf)?;
        }
        ProtocolMessage::Sync { channel, cursor, connection_serial, presence } => {
            buf.put_u8(FrameKind::Sync.into());
            put_string(buf, channel);
            put_opt_string(buf, cursor.as_deref());
            put_opt_varint_i64(buf, *connection_serial);
            ser_presence_list(presence, buf)?;
        }
    }
    Ok(())
}

fn deser_frame(buf: &mut &[u8]) -> Result<ProtocolMessage> {
    let raw_kind = try_get_byte(buf)?;
    let kind = FrameKind::try_from(raw_kind)
        .map_err(|_| Error::Decode(format!("unknown frame kind {}", raw_kind)))?;

    let msg = match kind {
        FrameKind::Heartbeat => ProtocolMessage::Heartbeat {
            id: try_get_opt_string(buf)?,
        },
        FrameKind::Ack => ProtocolMessage::Ack {
            msg_serial: try_get_varint_u64(buf)?,
            count: try_get_varint_u32(buf)?,
        },
        FrameKind::Nack => ProtocolMessage::Nack {
            msg_serial: try_get_varint_u64(buf)?,
            count: try_get_varint_u32(buf)?,
            error: deser_opt_error(buf)?,
        },
        FrameKind::Connected => ProtocolMessage::Connected {
            connection_id: try_get_string(buf)?,
            connection_key: try_get_string(buf)?,
            connection_serial: try_get_varint_i64(buf)?,
            details: ConnectionDetails {
                client_id: try_get_opt_string(buf)?,
                max_idle_interval_ms: try_get_varint_u64(buf)?,
                connection_state_ttl_ms: try_get_opt_varint_u64(buf)?,
            },
            error: deser_opt_error(buf)?,
        },
        FrameKind::Disconnected => ProtocolMessage::Disconnected {
            error: deser_opt_error(buf)?,
        },
        FrameKind::Close => ProtocolMessage::Close,
        FrameKind::Closed => ProtocolMessage::Closed,
        FrameKind::Error => ProtocolMessage::Error {
            channel: try_get_opt_string(buf)?,
            error: deser_error(buf)?,
        },
        FrameKind::Attach => ProtocolMessage::Attach {
            channel: try_get_string(buf)?,
        },
        FrameKind::Attached => {
            let channel = try_get_string(buf)?;
            let flags = try_get_byte(buf)?;
            ProtocolMessage::Attached {
                channel,
                resumed: flags & FLAG_RESUMED != 0,
                has_presence: flags & FLAG_HAS_PRESENCE != 0,
                error: deser_opt_error(buf)?,
            }
        }
        FrameKind::Detach => ProtocolMessage::Detach {
            channel: try_get_string(buf)?,
        },
        FrameKind::Detached => ProtocolMessage::Detached {
            channel: try_get_string(buf)?,
            error: deser_opt_error(buf)?,
        },
        FrameKind::Message => {
            let channel = try_get_string(buf)?;
            let msg_serial = try_get_opt_varint_u64(buf)?;
            let connection_serial = try_get_opt_varint_i64(buf)?;
            let num_messages = try_get_varint_u64(buf)?;
            let mut messages = Vec::new();
            for _ in 0..num_messages {
                messages.push(deser_message(buf)?);
            }
            ProtocolMessage::Message { channel, msg_serial, connection_serial, messages }
        }
        FrameKind::Presence => ProtocolMessage::Presence {
            channel: try_get_string(buf)?,
            msg_serial: try_get_opt_varint_u64(buf)?,
            connection_serial: try_get_opt_varint_i64(buf)?,
            presence: deser_presence_list(buf)?,
        },
        FrameKind::Sync => ProtocolMessage::Sync {
            channel: try_get_string(buf)?,
            cursor: try_get_opt_string(buf)?,
            connection_serial: try_get_opt_varint_i64(buf)?,
            presence: deser_presence_list(buf)?,
        },
    };
    Ok(msg)
}

fn ser_error(error: &ErrorInfo, buf: &mut BytesMut) {
    buf.put_u32_varint(error.code);
    buf.put_u32_varint(error.status_code as u32);
    put_string(buf, &error.message);
}

fn deser_error(buf: &mut &[u8]) -> Result<ErrorInfo> {
    let code = try_get_varint_u32(buf)?;
    let status_code = try_get_varint_u32(buf)?;
    let status_code = u16::try_from(status_code)
        .map_err(|_| Error::Decode(format!("status code {} out of range", status_code)))?;
    Ok(ErrorInfo {
        code,
        status_code,
        message: try_get_string(buf)?,
    })
}

fn ser_opt_error(error: Option<&ErrorInfo>, buf: &mut BytesMut) {
    match error {
        Some(error) => {
            buf.put_u8(1);
            ser_error(error, buf);
        }
        None => buf.put_u8(0),
    }
}

fn deser_opt_error(buf: &mut &[u8]) -> Result<Option<ErrorInfo>> {
    match try_get_byte(buf)? {
        0 => Ok(None),
        1 => Ok(Some(deser_error(buf)?)),
        other => Err(Error::Decode(format!("invalid option marker {}", other))),
    }
}

fn ser_data(data: &Value, buf: &mut BytesMut) -> Result<()> {
    if data.is_null() {
        put_bytes(buf, b"");
        return Ok(());
    }
    let raw = serde_json::to_vec(data)
        .map_err(|e| Error::Decode(format!("cannot encode payload: {}", e)))?;
    put_bytes(buf, &raw);
    Ok(())
}

fn deser_data(buf: &mut &[u8]) -> Result<Value> {
    let raw = try_get_bytes(buf)?;
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&raw)
        .map_err(|e| Error::Decode(format!("invalid payload: {}", e)))
}

fn ser_message(msg: &Message, buf: &mut BytesMut) -> Result<()> {
    put_opt_string(buf, msg.id.as_deref());
    put_opt_string(buf, msg.name.as_deref());
    ser_data(&msg.data, buf)?;
    put_opt_string(buf, msg.client_id.as_deref());
    put_opt_string(buf, msg.connection_id.as_deref());
    put_opt_varint_i64(buf, msg.timestamp);
    Ok(())
}

fn deser_message(buf: &mut &[u8]) -> Result<Message> {
    Ok(Message {
        id: try_get_opt_string(buf)?,
        name: try_get_opt_string(buf)?,
        data: deser_data(buf)?,
        client_id: try_get_opt_string(buf)?,
        connection_id: try_get_opt_string(buf)?,
        timestamp: try_get_opt_varint_i64(buf)?,
    })
}

fn ser_presence_list(presence: &[PresenceMessage], buf: &mut BytesMut) -> Result<()> {
    buf.put_usize_varint(presence.len());
    for p in presence {
        buf.put_u8(p.action.into());
        put_string(buf, &p.client_id);
        put_opt_string(buf, p.connection_id.as_deref());
        put_opt_string(buf, p.id.as_deref());
        ser_data(&p.data, buf)?;
        put_opt_varint_i64(buf, p.timestamp);
    }
    Ok(())
}

fn deser_presence_list(buf: &mut &[u8]) -> Result<Vec<PresenceMessage>> {
    let num_entries = try_get_varint_u64(buf)?;
    let mut result = Vec::new();
    for _ in 0..num_entries {
        let raw_action = try_get_byte(buf)?;
        let action = PresenceAction::try_from(raw_action)
            .map_err(|_| Error::Decode(format!("unknown presence action {}", raw_action)))?;
        result.push(PresenceMessage {
            action,
            client_id: try_get_string(buf)?,
            connection_id: try_get_opt_string(buf)?,
            id: try_get_opt_string(buf)?,
            data: deser_data(buf)?,
            timestamp: try_get_opt_varint_i64(buf)?,
        });
    }
    Ok(result)
}
