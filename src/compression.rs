//! Decompression codecs keyed by the `compression_type` carried in message metadata.
//!
//! The wire codec itself is out of scope for this crate; only the decode
//! side of each compression algorithm is needed, since the consumer never compresses
//! outgoing data.

use crate::error::ConsumerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Lz4,
    Zlib,
    ZStd,
    Snappy,
}

/// Decompresses a payload of a known `CompressionType` to its original bytes.
///
/// `uncompressed_size` is a hint from the frame metadata used to pre-size the output
/// buffer; implementations must not trust it as an upper bound for memory safety, only
/// as a capacity hint.
pub trait Decompressor: Send + Sync {
    fn decompress(&self, compression: CompressionType, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError>;
}

/// The default [`Decompressor`], dispatching to whichever codec crates are enabled via
/// Cargo features. Compiling without a codec's feature makes messages using that codec
/// fail decompression with a descriptive error instead of failing to build.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDecompressor;

impl Decompressor for StandardDecompressor {
    fn decompress(&self, compression: CompressionType, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
        match compression {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Lz4 => decompress_lz4(data, uncompressed_size),
            CompressionType::Zlib => decompress_zlib(data, uncompressed_size),
            CompressionType::ZStd => decompress_zstd(data, uncompressed_size),
            CompressionType::Snappy => decompress_snappy(data, uncompressed_size),
        }
    }
}

#[cfg(feature = "lz4-codec")]
fn decompress_lz4(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
    use std::io::Read;
    let mut out = Vec::with_capacity(uncompressed_size);
    lz4::Decoder::new(data)
        .map_err(|e| ConsumerError::Decompression(e.to_string()))?
        .read_to_end(&mut out)
        .map_err(|e| ConsumerError::Decompression(e.to_string()))?;
    Ok(out)
}
#[cfg(not(feature = "lz4-codec"))]
fn decompress_lz4(_data: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
    Err(ConsumerError::Decompression("lz4 support not compiled in (enable the `lz4-codec` feature)".into()))
}

#[cfg(feature = "zlib")]
fn decompress_zlib(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
    use std::io::Read;
    let mut out = Vec::with_capacity(uncompressed_size);
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| ConsumerError::Decompression(e.to_string()))?;
    Ok(out)
}
#[cfg(not(feature = "zlib"))]
fn decompress_zlib(_data: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
    Err(ConsumerError::Decompression("zlib support not compiled in (enable the `zlib` feature)".into()))
}

#[cfg(feature = "zstd-codec")]
fn decompress_zstd(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
    zstd::stream::decode_all(data).map_err(|e| ConsumerError::Decompression(e.to_string())).map(|mut v| {
        v.shrink_to(uncompressed_size.max(v.len()));
        v
    })
}
#[cfg(not(feature = "zstd-codec"))]
fn decompress_zstd(_data: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
    Err(ConsumerError::Decompression("zstd support not compiled in (enable the `zstd-codec` feature)".into()))
}

#[cfg(feature = "snappy")]
fn decompress_snappy(data: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
    snap::raw::Decoder::new().decompress_vec(data).map_err(|e| ConsumerError::Decompression(e.to_string()))
}
#[cfg(not(feature = "snappy"))]
fn decompress_snappy(_data: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>, ConsumerError> {
    Err(ConsumerError::Decompression("snappy support not compiled in (enable the `snappy` feature)".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_roundtrips() {
        let codec = StandardDecompressor;
        let data = b"hello world";
        let out = codec.decompress(CompressionType::None, data, data.len()).unwrap();
        assert_eq!(out, data);
    }
}
