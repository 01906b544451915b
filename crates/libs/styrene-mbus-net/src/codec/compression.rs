//! Body compression for the structured envelope.

use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;

use crate::config::{CompressionConfig, CompressionKind};
use crate::error::NetError;

/// Largest decoded part accepted from the wire.
pub const MAX_DECODED_SIZE: usize = 64 * 1024 * 1024;

/// Encoded bytes plus what is needed to restore them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compressed {
    pub kind: CompressionKind,
    pub decoded_size: usize,
    pub bytes: Vec<u8>,
}

impl Compressed {
    pub fn raw(bytes: Vec<u8>) -> Self {
        Self { kind: CompressionKind::None, decoded_size: bytes.len(), bytes }
    }
}

/// Compresses `data` when configured, large enough and actually smaller.
pub fn compress(config: &CompressionConfig, data: Vec<u8>) -> Compressed {
    if config.kind == CompressionKind::None || data.len() < config.threshold {
        return Compressed::raw(data);
    }
    match bzip2_compress(config.level, &data) {
        Ok(packed) if packed.len() < data.len() => {
            log::trace!("compression: {} -> {} bytes", data.len(), packed.len());
            Compressed { kind: config.kind, decoded_size: data.len(), bytes: packed }
        }
        Ok(_) => Compressed::raw(data),
        Err(err) => {
            log::warn!("compression: bzip2 failed, sending raw: {err}");
            Compressed::raw(data)
        }
    }
}

fn bzip2_compress(level: u32, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::new(level.clamp(1, 9)));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Restores a part read from the wire, checking its declared decoded size.
pub fn decompress(kind_id: u8, decoded_size: u32, bytes: Vec<u8>) -> Result<Vec<u8>, NetError> {
    let decoded_size = decoded_size as usize;
    if decoded_size > MAX_DECODED_SIZE {
        return Err(NetError::decode(format!(
            "decoded size {decoded_size} exceeds limit {MAX_DECODED_SIZE}"
        )));
    }
    let kind = CompressionKind::from_id(kind_id)
        .ok_or_else(|| NetError::decode(format!("unknown compression id {kind_id}")))?;
    let decoded = match kind {
        CompressionKind::None => bytes,
        CompressionKind::Bzip2 => {
            let mut decoded = Vec::with_capacity(decoded_size);
            BzDecoder::new(bytes.as_slice())
                .take(decoded_size as u64 + 1)
                .read_to_end(&mut decoded)
                .map_err(|err| NetError::decode(format!("bzip2: {err}")))?;
            decoded
        }
    };
    if decoded.len() != decoded_size {
        return Err(NetError::decode(format!(
            "part decoded to {} bytes, header said {decoded_size}",
            decoded.len()
        )));
    }
    Ok(decoded)
}
