use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};

/// Every control datagram is exactly this long, zero padded.
pub const MESSAGE_LEN: usize = 16;

const TAG_HELLO: u8 = 0x01;
const TAG_TARGET_UPDATE: u8 = 0x02;
const TAG_CAPTURE_REQUEST: u8 = 0x03;

/// Messages exchanged with the coordinator.
///
/// Addresses and ports are host order here; on the wire every field is
/// big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Liveness beacon carrying the sender's count of cold destinations.
    Hello { peer_cold_count: u16 },
    /// Authoritative replica count for one destination.
    TargetUpdate {
        address: u32,
        port: u16,
        replicas: u16,
    },
    /// A SYN towards a cold destination was intercepted.
    CaptureRequest { address: u32, port: u16 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram is {0} bytes, expected {MESSAGE_LEN}")]
    Length(usize),
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
}

impl ControlMessage {
    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut out = [0u8; MESSAGE_LEN];
        let mut buf = &mut out[..];
        match *self {
            ControlMessage::Hello { peer_cold_count } => {
                buf.put_u8(TAG_HELLO);
                buf.put_u16(peer_cold_count);
            }
            ControlMessage::TargetUpdate {
                address,
                port,
                replicas,
            } => {
                buf.put_u8(TAG_TARGET_UPDATE);
                buf.put_u32(address);
                buf.put_u16(port);
                buf.put_u16(replicas);
            }
            ControlMessage::CaptureRequest { address, port } => {
                buf.put_u8(TAG_CAPTURE_REQUEST);
                buf.put_u32(address);
                buf.put_u16(port);
            }
        }
        out
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.len() != MESSAGE_LEN {
            return Err(CodecError::Length(datagram.len()));
        }
        let mut buf = datagram;
        match buf.get_u8() {
            TAG_HELLO => Ok(ControlMessage::Hello {
                peer_cold_count: buf.get_u16(),
            }),
            TAG_TARGET_UPDATE => Ok(ControlMessage::TargetUpdate {
                address: buf.get_u32(),
                port: buf.get_u16(),
                replicas: buf.get_u16(),
            }),
            TAG_CAPTURE_REQUEST => Ok(ControlMessage::CaptureRequest {
                address: buf.get_u32(),
                port: buf.get_u16(),
            }),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ControlMessage::Hello { peer_cold_count } => {
                write!(f, "hello(cold={peer_cold_count})")
            }
            ControlMessage::TargetUpdate {
                address,
                port,
                replicas,
            } => write!(
                f,
                "target({}:{port} replicas={replicas})",
                Ipv4Addr::from(address)
            ),
            ControlMessage::CaptureRequest { address, port } => {
                write!(f, "request({}:{port})", Ipv4Addr::from(address))
            }
        }
    }
}
