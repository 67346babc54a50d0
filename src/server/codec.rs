use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::addr::{ipv4_from_wire, MacAddr};
use crate::engine::{RequestContext, RequestType};
use crate::lease::LeaseResult;

/// Frames are `u16` big-endian length + payload. The request payload is the
/// pre-decoded relay record; the response payload is a `LeaseResult`.
#[derive(Debug, Default)]
pub struct RequestCodec;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("truncated request payload")]
    Truncated,
    #[error("unknown request type {0}")]
    UnknownRequestType(u8),
    #[error("invalid mac length {0}")]
    InvalidMac(usize),
    #[error("host name isn't valid utf-8")]
    InvalidHostName,
}

fn decode_context(buf: &mut BytesMut) -> Result<RequestContext, CodecError> {
    if buf.remaining() < 9 {
        return Err(CodecError::Truncated);
    }
    let request_type = match buf.get_u8() {
        0 => RequestType::Discover,
        1 => RequestType::Request,
        2 => RequestType::Release,
        3 => RequestType::Decline,
        4 => RequestType::ConflictIp,
        other => return Err(CodecError::UnknownRequestType(other)),
    };
    let subnet_id = buf.get_u32();
    let request_addr = ipv4_from_wire(buf.get_u32_le());

    let client_id = read_short_bytes(buf)?;
    let mac_bytes = read_short_bytes(buf)?;
    let mac = match mac_bytes.len() {
        0 => None,
        6 => MacAddr::from_bytes(&mac_bytes),
        len => return Err(CodecError::InvalidMac(len)),
    };

    if buf.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    let name_len = buf.get_u16() as usize;
    if buf.remaining() < name_len {
        return Err(CodecError::Truncated);
    }
    let host_name = String::from_utf8(buf.split_to(name_len).to_vec())
        .map_err(|_| CodecError::InvalidHostName)?;

    Ok(RequestContext {
        request_type,
        subnet_id,
        client_id,
        mac,
        request_addr,
        host_name,
    })
}

fn read_short_bytes(buf: &mut BytesMut) -> Result<Vec<u8>, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(buf.split_to(len).to_vec())
}

impl Decoder for RequestCodec {
    type Item = RequestContext;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        src.advance(2);
        let mut payload = src.split_to(len);
        decode_context(&mut payload).map(Some)
    }
}

impl Encoder<LeaseResult> for RequestCodec {
    type Error = CodecError;

    fn encode(&mut self, result: LeaseResult, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(2 + 9);
        dst.put_u16(9);
        dst.put_u8(result.succeed as u8);
        dst.put_u32_le(result.addr);
        dst.put_u32(result.subnet_id);
        Ok(())
    }
}
