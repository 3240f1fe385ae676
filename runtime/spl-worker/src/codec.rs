//! Length-prefixed frames carrying msgpack or JSON bodies.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Frame exceeds max size"))?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Msgpack is tried first; the codec that succeeded answers the message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, WireCodec), String> {
    if let Ok(message) = rmp_serde::from_slice::<T>(bytes) {
        return Ok((message, WireCodec::Msgpack));
    }
    let message =
        serde_json::from_slice::<T>(bytes).map_err(|err| format!("Invalid request: {err}"))?;
    Ok((message, WireCodec::Json))
}

pub fn encode<T: Serialize>(message: &T, wire: WireCodec) -> Result<Vec<u8>, String> {
    match wire {
        WireCodec::Msgpack => rmp_serde::to_vec_named(message).map_err(|err| err.to_string()),
        WireCodec::Json => serde_json::to_vec(message).map_err(|err| err.to_string()),
    }
}
