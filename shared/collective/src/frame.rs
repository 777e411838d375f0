use std::io::{Read, Write};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::CollectiveError;

/// Frames are a 4-byte big-endian length followed by a postcard payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub(crate) fn encode<M: Serialize>(message: &M) -> Result<Bytes, CollectiveError> {
    Ok(Bytes::from(postcard::to_allocvec(message)?))
}

pub fn write_frame<W: Write, M: Serialize>(
    writer: &mut W,
    message: &M,
) -> Result<(), CollectiveError> {
    let payload = postcard::to_allocvec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CollectiveError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, M: DeserializeOwned>(reader: &mut R) -> Result<M, CollectiveError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CollectiveError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(postcard::from_bytes(&payload)?)
}
