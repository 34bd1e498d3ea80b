//! Wire format of the flush protocol.
//!
//! Message bodies are protobuf encoded:
//!
//! ```text
//! FlushRequest  { offset: u64 = 1, length: u64 = 2, op_context: u64 = 3 }
//! FlushResponse { op_context: u64 = 1 }
//! ```
//!
//! Each message slot of a [`MessageBuffer`](crate::buffer::MessageBuffer)
//! holds a send area at [`SEND_OFFSET`] and a receive area at
//! [`RECV_OFFSET`], each [`MSG_SIZE_MAX`] bytes.
//!
//! The handshake private data is a fixed little-endian [`PrivateData`]
//! record carrying the server's region descriptor.

use prost::Message;

use crate::error::{Error, Result};
use crate::mr::{DESCRIPTOR_SIZE, LocalMemoryRegion, RemoteMemoryRegion};

/// Largest encoded message.
pub const MSG_SIZE_MAX: usize = 512;
/// Offset of the send area within a slot.
pub const SEND_OFFSET: usize = 0;
/// Offset of the receive area within a slot.
pub const RECV_OFFSET: usize = MSG_SIZE_MAX;

/// Request to make `[offset, offset + length)` of the server region durable.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct FlushRequest {
    #[prost(uint64, tag = "1")]
    pub offset: u64,
    #[prost(uint64, tag = "2")]
    pub length: u64,
    /// Opaque token echoed by the response.
    #[prost(uint64, tag = "3")]
    pub op_context: u64,
}

/// Acknowledgement of a completed flush.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct FlushResponse {
    #[prost(uint64, tag = "1")]
    pub op_context: u64,
}

/// Encode `msg` into `buf`, returning the encoded length.
pub fn encode<M: Message>(msg: &M, buf: &mut [u8]) -> Result<usize> {
    let len = msg.encoded_len();
    if len > MSG_SIZE_MAX || len > buf.len() {
        return Err(Error::Protocol(format!(
            "message of {} bytes exceeds buffer of {} bytes",
            len,
            buf.len().min(MSG_SIZE_MAX)
        )));
    }
    let mut out = &mut buf[..len];
    msg.encode(&mut out)
        .map_err(|e| Error::Protocol(e.to_string()))?;
    Ok(len)
}

/// Decode a message from exactly `buf`.
pub fn decode<M: Message + Default>(buf: &[u8]) -> Result<M> {
    if buf.len() > MSG_SIZE_MAX {
        return Err(Error::Protocol(format!(
            "message of {} bytes exceeds {}",
            buf.len(),
            MSG_SIZE_MAX
        )));
    }
    M::decode(buf).map_err(|e| Error::Protocol(e.to_string()))
}

const DESCRIPTORS_LEN: usize = 24;

/// Handshake private data sent by the server with its accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateData {
    /// Where application data starts in the region.
    pub data_offset: u64,
    pub descriptor_size: u32,
    pub descriptors: [u8; DESCRIPTORS_LEN],
}

impl PrivateData {
    /// Serialized size.
    pub const SIZE: usize = 8 + 4 + DESCRIPTORS_LEN;

    pub fn from_region(mr: &LocalMemoryRegion, data_offset: u64) -> Self {
        let mut descriptors = [0u8; DESCRIPTORS_LEN];
        descriptors[..DESCRIPTOR_SIZE].copy_from_slice(&mr.descriptor().to_bytes());
        Self {
            data_offset,
            descriptor_size: DESCRIPTOR_SIZE as u32,
            descriptors,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.data_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.descriptor_size.to_le_bytes());
        out[12..].copy_from_slice(&self.descriptors);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Protocol(format!(
                "private data too short: {} bytes",
                bytes.len()
            )));
        }
        let mut data_offset = [0u8; 8];
        let mut descriptor_size = [0u8; 4];
        let mut descriptors = [0u8; DESCRIPTORS_LEN];
        data_offset.copy_from_slice(&bytes[0..8]);
        descriptor_size.copy_from_slice(&bytes[8..12]);
        descriptors.copy_from_slice(&bytes[12..Self::SIZE]);
        let pdata = Self {
            data_offset: u64::from_le_bytes(data_offset),
            descriptor_size: u32::from_le_bytes(descriptor_size),
            descriptors,
        };
        if pdata.descriptor_size as usize > DESCRIPTORS_LEN {
            return Err(Error::Protocol(format!(
                "descriptor size {} exceeds {}",
                pdata.descriptor_size, DESCRIPTORS_LEN
            )));
        }
        Ok(pdata)
    }

    /// The region described by the embedded descriptor.
    pub fn region(&self) -> Result<RemoteMemoryRegion> {
        RemoteMemoryRegion::from_descriptor(&self.descriptors[..self.descriptor_size as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = FlushRequest {
            offset: 0x1000,
            length: 0x40,
            op_context: 0xAA,
        };
        let mut buf = [0u8; MSG_SIZE_MAX];
        let len = encode(&req, &mut buf).unwrap();
        assert_eq!(decode::<FlushRequest>(&buf[..len]).unwrap(), req);

        let resp = FlushResponse { op_context: 0xAA };
        let len = encode(&resp, &mut buf).unwrap();
        assert_eq!(decode::<FlushResponse>(&buf[..len]).unwrap(), resp);
    }

    #[test]
    fn test_zero_message_is_empty() {
        let mut buf = [0u8; 16];
        assert_eq!(encode(&FlushResponse { op_context: 0 }, &mut buf).unwrap(), 0);
        assert_eq!(
            decode::<FlushResponse>(&[]).unwrap(),
            FlushResponse { op_context: 0 }
        );
    }

    #[test]
    fn test_encode_rejects_small_buffer() {
        let req = FlushRequest {
            offset: u64::MAX,
            length: u64::MAX,
            op_context: u64::MAX,
        };
        let mut buf = [0u8; 8];
        assert!(matches!(encode(&req, &mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decode_garbage() {
        // Field 1 declared as length-delimited with a length past the end.
        assert!(decode::<FlushRequest>(&[0x0A, 0x10, 0x01]).is_err());
        assert!(decode::<FlushRequest>(&[0u8; MSG_SIZE_MAX + 1]).is_err());
    }

    #[test]
    fn test_private_data_layout() {
        let mut descriptors = [0u8; 24];
        descriptors[0] = 0x11;
        let pdata = PrivateData {
            data_offset: 64,
            descriptor_size: 21,
            descriptors,
        };
        let bytes = pdata.to_bytes();
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[0..8], &64u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &21u32.to_le_bytes());
        assert_eq!(bytes[12], 0x11);
        assert_eq!(PrivateData::from_bytes(&bytes).unwrap(), pdata);
        assert!(PrivateData::from_bytes(&bytes[..35]).is_err());
    }
}
