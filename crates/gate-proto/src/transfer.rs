//! Backend dialect: messages on the persistent gateway↔backend uplinks.
//!
//! Tags:
//!
//! ```text
//! 1 Segment            6 MessageS          11 ServiceInstIRes
//! 2 Handshake          7 BroadcastS        12 ServiceInstIReq
//! 3 RegisterS          8 MessageRouter
//! 4 UnregisterS        9 RpcRReq
//! 5 HeartbeatS        10 RpcRRes
//! ```
//!
//! [`GatewayMsg`] covers the gateway→backend wire direction,
//! [`BackendMsg`] the backend→gateway direction.  A tag can appear in
//! both with different bodies (`RegisterS` request vs response).  RPC
//! envelopes are authored by backend instances, carried through the
//! gateway as opaque router payload, and decoded by the receiving
//! backend, so they live on the gateway→backend side of the tag space.
//!
//! [`GatewayMsg::encode_frames`] transparently segments a body larger
//! than the ceiling; a decoded run of segments is stitched back together
//! by [`crate::segment::SegmentBuffer`].

use bytes::Bytes;

use crate::segment::{self, SEGMENT_OVERHEAD};
use crate::wire::{Reader, Writer};
use crate::{ByteOrder, CodecError, MAX_FRAME, MAX_SERVICE_LEN, MAX_STRING_LEN};

pub const TAG_SEGMENT: u8 = 1;
pub const TAG_HANDSHAKE: u8 = 2;
pub const TAG_REGISTER_S: u8 = 3;
pub const TAG_UNREGISTER_S: u8 = 4;
pub const TAG_HEARTBEAT_S: u8 = 5;
pub const TAG_MESSAGE_S: u8 = 6;
pub const TAG_BROADCAST_S: u8 = 7;
pub const TAG_MESSAGE_ROUTER: u8 = 8;
pub const TAG_RPC_R_REQ: u8 = 9;
pub const TAG_RPC_R_RES: u8 = 10;
pub const TAG_SERVICE_INST_I_RES: u8 = 11;
pub const TAG_SERVICE_INST_I_REQ: u8 = 12;

/// Routing disciplines carried by `MessageRouter.router_type`.
pub const ROUTE_TYPE_ALL: i16 = 0;
pub const ROUTE_TYPE_SERVICE: i16 = -1;

/// Response codes of the backend channel.
pub mod code {
    pub const SUCCESS: u16 = 0;
    pub const INVALID_AUTH: u16 = 1;
    pub const INVALID_SERVICE: u16 = 2;
    pub const INVALID_SERVICE_ID: u16 = 3;
    pub const INVALID_TRANSFER_ID: u16 = 4;
    pub const INNER_ERROR: u16 = 5;
    pub const AUTH_FAILED: u16 = 6;
    pub const ROUTE_ERROR: u16 = 7;
}

/// Messages flowing gateway → backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayMsg {
    /// Uplink handshake.  `conn_ids` and `router_ids` carry the sessions
    /// this gateway already has registered against the peer, so a
    /// reconnecting gateway can resume them.
    HandshakeReq {
        id: String,
        auth_key: String,
        service: String,
        service_id: String,
        conn_ids: Vec<u64>,
        router_ids: Vec<String>,
    },
    /// Login on behalf of a user connection; the payload is the user's
    /// first application message.
    RegisterSReq { conn_id: u64, payload: Vec<u8> },
    UnregisterSReq { conn_id: u64 },
    /// Forwarded user heartbeat, or the empty uplink keepalive.
    HeartbeatSReq { conn_id: u64, payload: Vec<u8> },
    MessageSReq { conn_id: u64, payload: Vec<u8> },
    /// Current enabled instance ids of a service, answering
    /// [`BackendMsg::ServiceInstIReq`].
    ServiceInstIRes {
        service: String,
        instance_ids: Vec<String>,
    },
    /// Inter-instance RPC request, relayed opaquely inside a
    /// `MessageRouter` envelope.
    RpcRReq {
        source_srv: String,
        source_id: String,
        rpc_id: u32,
        payload: Vec<u8>,
    },
    RpcRRes {
        code: u16,
        rpc_id: u32,
        payload: Vec<u8>,
    },
    Segment {
        amount: u16,
        seq: u16,
        frame: Vec<u8>,
    },
}

/// Messages flowing backend → gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMsg {
    HandshakeRes {
        code: u16,
    },
    RegisterSRes {
        conn_id: u64,
        code: u16,
        router_id: String,
        payload: Vec<u8>,
    },
    UnregisterSRes {
        conn_id: u64,
    },
    HeartbeatSRes {
        conn_id: u64,
        payload: Vec<u8>,
    },
    MessageSRes {
        conn_id: u64,
        payload: Vec<u8>,
    },
    /// One payload delivered to many user connections.
    BroadcastSRes {
        conn_ids: Vec<u64>,
        payload: Vec<u8>,
    },
    /// Routing envelope: forward `payload` (a complete frame) to
    /// instances of `router_service` per `router_type`.
    MessageRouter {
        router_service: String,
        router_type: i16,
        router_id: String,
        payload: Vec<u8>,
    },
    /// Ask for the enabled instance ids of a service.
    ServiceInstIReq {
        service: String,
    },
    Segment {
        amount: u16,
        seq: u16,
        frame: Vec<u8>,
    },
}

impl GatewayMsg {
    pub fn encode_body(&self, order: ByteOrder) -> Result<Vec<u8>, CodecError> {
        match self {
            GatewayMsg::HandshakeReq {
                id,
                auth_key,
                service,
                service_id,
                conn_ids,
                router_ids,
            } => {
                let mut w = Writer::with_capacity(
                    1 + 8
                        + id.len()
                        + auth_key.len()
                        + service.len()
                        + service_id.len()
                        + 4
                        + conn_ids.len() * 8
                        + router_ids.iter().map(|r| 2 + r.len()).sum::<usize>(),
                    order,
                );
                w.u8(TAG_HANDSHAKE);
                w.string(id, MAX_STRING_LEN)?;
                w.string(auth_key, MAX_STRING_LEN)?;
                w.string(service, MAX_SERVICE_LEN)?;
                w.string(service_id, MAX_STRING_LEN)?;
                w.u64_array(conn_ids)?;
                w.string_array(router_ids, MAX_STRING_LEN)?;
                Ok(w.into_inner())
            }
            GatewayMsg::RegisterSReq { conn_id, payload } => {
                Ok(conn_payload_body(TAG_REGISTER_S, *conn_id, payload, order))
            }
            GatewayMsg::UnregisterSReq { conn_id } => {
                Ok(conn_payload_body(TAG_UNREGISTER_S, *conn_id, &[], order))
            }
            GatewayMsg::HeartbeatSReq { conn_id, payload } => {
                Ok(conn_payload_body(TAG_HEARTBEAT_S, *conn_id, payload, order))
            }
            GatewayMsg::MessageSReq { conn_id, payload } => {
                Ok(conn_payload_body(TAG_MESSAGE_S, *conn_id, payload, order))
            }
            GatewayMsg::ServiceInstIRes {
                service,
                instance_ids,
            } => {
                let mut w = Writer::with_capacity(
                    1 + 4
                        + service.len()
                        + instance_ids.iter().map(|i| 2 + i.len()).sum::<usize>(),
                    order,
                );
                w.u8(TAG_SERVICE_INST_I_RES);
                w.string(service, MAX_SERVICE_LEN)?;
                w.string_array(instance_ids, MAX_STRING_LEN)?;
                Ok(w.into_inner())
            }
            GatewayMsg::RpcRReq {
                source_srv,
                source_id,
                rpc_id,
                payload,
            } => {
                let mut w = Writer::with_capacity(
                    1 + 4 + source_srv.len() + source_id.len() + 4 + payload.len(),
                    order,
                );
                w.u8(TAG_RPC_R_REQ);
                w.string(source_srv, MAX_SERVICE_LEN)?;
                w.string(source_id, MAX_STRING_LEN)?;
                w.u32(*rpc_id);
                w.bytes(payload);
                Ok(w.into_inner())
            }
            GatewayMsg::RpcRRes {
                code,
                rpc_id,
                payload,
            } => {
                let mut w = Writer::with_capacity(1 + 2 + 4 + payload.len(), order);
                w.u8(TAG_RPC_R_RES);
                w.u16(*code);
                w.u32(*rpc_id);
                w.bytes(payload);
                Ok(w.into_inner())
            }
            GatewayMsg::Segment { amount, seq, frame } => {
                Ok(segment_body(*amount, *seq, frame, order))
            }
        }
    }

    /// Encodes one or more length-prefixed frames, segmenting the body
    /// when it exceeds the frame ceiling.
    pub fn encode_frames(&self, order: ByteOrder) -> Result<Bytes, CodecError> {
        frames_from_body(self.encode_body(order)?, order)
    }

    pub fn decode(body: &[u8], order: ByteOrder) -> Result<Self, CodecError> {
        if body.is_empty() {
            return Err(CodecError::ShortBuffer);
        }
        let mut r = Reader::new(&body[1..], order);
        match body[0] {
            TAG_HANDSHAKE => Ok(GatewayMsg::HandshakeReq {
                id: r.string()?,
                auth_key: r.string()?,
                service: r.string()?,
                service_id: r.string()?,
                conn_ids: r.u64_array()?,
                router_ids: r.string_array()?,
            }),
            TAG_REGISTER_S => Ok(GatewayMsg::RegisterSReq {
                conn_id: r.u64()?,
                payload: r.take_rest(),
            }),
            TAG_UNREGISTER_S => Ok(GatewayMsg::UnregisterSReq { conn_id: r.u64()? }),
            TAG_HEARTBEAT_S => Ok(GatewayMsg::HeartbeatSReq {
                conn_id: r.u64()?,
                payload: r.take_rest(),
            }),
            TAG_MESSAGE_S => Ok(GatewayMsg::MessageSReq {
                conn_id: r.u64()?,
                payload: r.take_rest(),
            }),
            TAG_SERVICE_INST_I_RES => Ok(GatewayMsg::ServiceInstIRes {
                service: r.string()?,
                instance_ids: r.string_array()?,
            }),
            TAG_RPC_R_REQ => Ok(GatewayMsg::RpcRReq {
                source_srv: r.string()?,
                source_id: r.string()?,
                rpc_id: r.u32()?,
                payload: r.take_rest(),
            }),
            TAG_RPC_R_RES => Ok(GatewayMsg::RpcRRes {
                code: r.u16()?,
                rpc_id: r.u32()?,
                payload: r.take_rest(),
            }),
            TAG_SEGMENT => Ok(GatewayMsg::Segment {
                amount: r.u16()?,
                seq: r.u16()?,
                frame: r.take_rest(),
            }),
            tag => Err(CodecError::InvalidMessage(tag)),
        }
    }
}

impl BackendMsg {
    pub fn encode_body(&self, order: ByteOrder) -> Result<Vec<u8>, CodecError> {
        match self {
            BackendMsg::HandshakeRes { code } => {
                let mut w = Writer::with_capacity(3, order);
                w.u8(TAG_HANDSHAKE);
                w.u16(*code);
                Ok(w.into_inner())
            }
            BackendMsg::RegisterSRes {
                conn_id,
                code,
                router_id,
                payload,
            } => {
                let mut w =
                    Writer::with_capacity(1 + 8 + 2 + 2 + router_id.len() + payload.len(), order);
                w.u8(TAG_REGISTER_S);
                w.u64(*conn_id);
                w.u16(*code);
                w.string(router_id, MAX_STRING_LEN)?;
                w.bytes(payload);
                Ok(w.into_inner())
            }
            BackendMsg::UnregisterSRes { conn_id } => {
                Ok(conn_payload_body(TAG_UNREGISTER_S, *conn_id, &[], order))
            }
            BackendMsg::HeartbeatSRes { conn_id, payload } => {
                Ok(conn_payload_body(TAG_HEARTBEAT_S, *conn_id, payload, order))
            }
            BackendMsg::MessageSRes { conn_id, payload } => {
                Ok(conn_payload_body(TAG_MESSAGE_S, *conn_id, payload, order))
            }
            BackendMsg::BroadcastSRes { conn_ids, payload } => {
                let mut w =
                    Writer::with_capacity(1 + 2 + conn_ids.len() * 8 + payload.len(), order);
                w.u8(TAG_BROADCAST_S);
                w.u64_array(conn_ids)?;
                w.bytes(payload);
                Ok(w.into_inner())
            }
            BackendMsg::MessageRouter {
                router_service,
                router_type,
                router_id,
                payload,
            } => {
                let mut w = Writer::with_capacity(
                    1 + 2 + router_service.len() + 2 + 2 + router_id.len() + payload.len(),
                    order,
                );
                w.u8(TAG_MESSAGE_ROUTER);
                w.string(router_service, MAX_SERVICE_LEN)?;
                w.i16(*router_type);
                w.string(router_id, MAX_STRING_LEN)?;
                w.bytes(payload);
                Ok(w.into_inner())
            }
            BackendMsg::ServiceInstIReq { service } => {
                let mut w = Writer::with_capacity(1 + 2 + service.len(), order);
                w.u8(TAG_SERVICE_INST_I_REQ);
                w.string(service, MAX_SERVICE_LEN)?;
                Ok(w.into_inner())
            }
            BackendMsg::Segment { amount, seq, frame } => {
                Ok(segment_body(*amount, *seq, frame, order))
            }
        }
    }

    pub fn encode_frames(&self, order: ByteOrder) -> Result<Bytes, CodecError> {
        frames_from_body(self.encode_body(order)?, order)
    }

    pub fn decode(body: &[u8], order: ByteOrder) -> Result<Self, CodecError> {
        if body.is_empty() {
            return Err(CodecError::ShortBuffer);
        }
        let mut r = Reader::new(&body[1..], order);
        match body[0] {
            TAG_HANDSHAKE => Ok(BackendMsg::HandshakeRes { code: r.u16()? }),
            TAG_REGISTER_S => Ok(BackendMsg::RegisterSRes {
                conn_id: r.u64()?,
                code: r.u16()?,
                router_id: r.string()?,
                payload: r.take_rest(),
            }),
            TAG_UNREGISTER_S => Ok(BackendMsg::UnregisterSRes { conn_id: r.u64()? }),
            TAG_HEARTBEAT_S => Ok(BackendMsg::HeartbeatSRes {
                conn_id: r.u64()?,
                payload: r.take_rest(),
            }),
            TAG_MESSAGE_S => Ok(BackendMsg::MessageSRes {
                conn_id: r.u64()?,
                payload: r.take_rest(),
            }),
            TAG_BROADCAST_S => Ok(BackendMsg::BroadcastSRes {
                conn_ids: r.u64_array()?,
                payload: r.take_rest(),
            }),
            TAG_MESSAGE_ROUTER => Ok(BackendMsg::MessageRouter {
                router_service: r.string()?,
                router_type: r.i16()?,
                router_id: r.string()?,
                payload: r.take_rest(),
            }),
            TAG_SERVICE_INST_I_REQ => Ok(BackendMsg::ServiceInstIReq {
                service: r.string()?,
            }),
            TAG_SEGMENT => Ok(BackendMsg::Segment {
                amount: r.u16()?,
                seq: r.u16()?,
                frame: r.take_rest(),
            }),
            tag => Err(CodecError::InvalidMessage(tag)),
        }
    }
}

fn conn_payload_body(tag: u8, conn_id: u64, payload: &[u8], order: ByteOrder) -> Vec<u8> {
    let mut w = Writer::with_capacity(1 + 8 + payload.len(), order);
    w.u8(tag);
    w.u64(conn_id);
    w.bytes(payload);
    w.into_inner()
}

fn segment_body(amount: u16, seq: u16, frame: &[u8], order: ByteOrder) -> Vec<u8> {
    let mut w = Writer::with_capacity(1 + 2 + 2 + frame.len(), order);
    w.u8(TAG_SEGMENT);
    w.u16(amount);
    w.u16(seq);
    w.bytes(frame);
    w.into_inner()
}

/// Wraps an encoded body into length-prefixed frames, segmenting when
/// it exceeds the frame ceiling.
pub fn frames_from_body(body: Vec<u8>, order: ByteOrder) -> Result<Bytes, CodecError> {
    if body.len() > MAX_FRAME {
        return segment::segment_frames(&body, order);
    }
    let mut out = Vec::with_capacity(2 + body.len());
    let len = body.len() as u16;
    match order {
        ByteOrder::Big => out.extend_from_slice(&len.to_be_bytes()),
        ByteOrder::Little => out.extend_from_slice(&len.to_le_bytes()),
    }
    out.extend_from_slice(&body);
    Ok(Bytes::from(out))
}

/// Number of frames a body of `len` bytes encodes to.
pub fn frame_count(len: usize) -> usize {
    if len <= MAX_FRAME {
        1
    } else {
        len.div_ceil(MAX_FRAME - SEGMENT_OVERHEAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: ByteOrder = ByteOrder::Big;

    fn gateway_samples() -> Vec<GatewayMsg> {
        vec![
            GatewayMsg::HandshakeReq {
                id: "gw-1".into(),
                auth_key: "secret".into(),
                service: "echo".into(),
                service_id: "ts-1".into(),
                conn_ids: vec![11, 12, 13],
                router_ids: vec!["u-1".into(), "u-2".into()],
            },
            GatewayMsg::RegisterSReq {
                conn_id: 7,
                payload: b"login".to_vec(),
            },
            GatewayMsg::UnregisterSReq { conn_id: 7 },
            GatewayMsg::HeartbeatSReq {
                conn_id: 0,
                payload: vec![],
            },
            GatewayMsg::MessageSReq {
                conn_id: 9,
                payload: b"msg".to_vec(),
            },
            GatewayMsg::ServiceInstIRes {
                service: "echo".into(),
                instance_ids: vec!["ts-1".into(), "ts-2".into()],
            },
            GatewayMsg::RpcRReq {
                source_srv: "echo".into(),
                source_id: "ts-1".into(),
                rpc_id: 42,
                payload: b"req".to_vec(),
            },
            GatewayMsg::RpcRRes {
                code: code::SUCCESS,
                rpc_id: 42,
                payload: b"res".to_vec(),
            },
            GatewayMsg::Segment {
                amount: 2,
                seq: 1,
                frame: vec![1, 2, 3],
            },
        ]
    }

    fn backend_samples() -> Vec<BackendMsg> {
        vec![
            BackendMsg::HandshakeRes { code: code::SUCCESS },
            BackendMsg::RegisterSRes {
                conn_id: 7,
                code: code::SUCCESS,
                router_id: "u-42".into(),
                payload: b"ok".to_vec(),
            },
            BackendMsg::UnregisterSRes { conn_id: 7 },
            BackendMsg::HeartbeatSRes {
                conn_id: 7,
                payload: vec![4],
            },
            BackendMsg::MessageSRes {
                conn_id: 7,
                payload: b"pong".to_vec(),
            },
            BackendMsg::BroadcastSRes {
                conn_ids: vec![1, 2, 3],
                payload: b"news".to_vec(),
            },
            BackendMsg::MessageRouter {
                router_service: "match".into(),
                router_type: ROUTE_TYPE_SERVICE,
                router_id: "m-2".into(),
                payload: b"framed".to_vec(),
            },
            BackendMsg::ServiceInstIReq {
                service: "echo".into(),
            },
            BackendMsg::Segment {
                amount: 3,
                seq: 0,
                frame: vec![9],
            },
        ]
    }

    #[test]
    fn gateway_messages_round_trip_in_both_orders() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            for msg in gateway_samples() {
                let body = msg.encode_body(order).unwrap();
                assert_eq!(GatewayMsg::decode(&body, order).unwrap(), msg);
            }
        }
    }

    #[test]
    fn backend_messages_round_trip_in_both_orders() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            for msg in backend_samples() {
                let body = msg.encode_body(order).unwrap();
                assert_eq!(BackendMsg::decode(&body, order).unwrap(), msg);
            }
        }
    }

    #[test]
    fn decoded_payload_survives_source_reuse() {
        let msg = BackendMsg::MessageSRes {
            conn_id: 3,
            payload: b"stable".to_vec(),
        };
        let mut body = msg.encode_body(ORDER).unwrap();
        let decoded = BackendMsg::decode(&body, ORDER).unwrap();
        body.iter_mut().for_each(|b| *b = 0);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_failures() {
        assert_eq!(GatewayMsg::decode(&[], ORDER), Err(CodecError::ShortBuffer));
        assert_eq!(
            BackendMsg::decode(&[0x40], ORDER),
            Err(CodecError::InvalidMessage(0x40))
        );
        // RegisterSRes cut off inside the router id string.
        let full = BackendMsg::RegisterSRes {
            conn_id: 1,
            code: 0,
            router_id: "abcdef".into(),
            payload: vec![],
        }
        .encode_body(ORDER)
        .unwrap();
        assert_eq!(
            BackendMsg::decode(&full[..full.len() - 3], ORDER),
            Err(CodecError::Truncated)
        );
    }

    #[test]
    fn oversized_service_name_fails_encode() {
        let msg = BackendMsg::MessageRouter {
            router_service: "s".repeat(256),
            router_type: ROUTE_TYPE_ALL,
            router_id: String::new(),
            payload: vec![],
        };
        assert_eq!(msg.encode_body(ORDER), Err(CodecError::MessageTooLarge));
    }

    #[test]
    fn small_bodies_produce_one_frame() {
        let msg = GatewayMsg::MessageSReq {
            conn_id: 1,
            payload: vec![0xab; 64],
        };
        let framed = msg.encode_frames(ORDER).unwrap();
        let len = u16::from_be_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(len, framed.len() - 2);
        assert_eq!(
            GatewayMsg::decode(&framed[2..], ORDER).unwrap(),
            msg
        );
    }
}
