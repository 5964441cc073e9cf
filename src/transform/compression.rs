//! Content coding for payload bodies.
//!
//! Decompression reads through `Read::take(limit + 1)`: one byte past the
//! limit is enough to know the input is too big, and nothing beyond that is
//! ever inflated.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::config::TransformConfig;
use crate::transform::TransformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Zstd,
}

impl Encoding {
    /// Token as used in `content-encoding` / `accept-encoding`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Zstd => "zstd",
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Encoding::Identity)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Encoding::Identity),
            "gzip" | "x-gzip" => Ok(Encoding::Gzip),
            "deflate" => Ok(Encoding::Deflate),
            "zstd" => Ok(Encoding::Zstd),
            other => Err(TransformError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Output ceiling for decompression.
#[derive(Debug, Clone, Copy)]
pub struct DecompressionLimits {
    pub max_output: usize,
    /// Output/input ratio; 0 disables the ratio check.
    pub max_ratio: u32,
}

impl DecompressionLimits {
    pub fn from_config(config: &TransformConfig) -> Self {
        Self {
            max_output: config.max_decompressed_size,
            max_ratio: config.max_expansion_ratio,
        }
    }

    pub fn limit_for(&self, input_len: usize) -> usize {
        if self.max_ratio == 0 {
            return self.max_output;
        }
        self.max_output
            .min(input_len.saturating_mul(self.max_ratio as usize))
    }
}

/// Compress `data`. `level` is clamped to what the codec accepts.
pub fn compress(encoding: Encoding, data: &[u8], level: u32) -> Result<Vec<u8>, TransformError> {
    match encoding {
        Encoding::Identity => Ok(data.to_vec()),
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Encoding::Zstd => Ok(zstd::stream::encode_all(data, level.clamp(1, 22) as i32)?),
    }
}

/// Decompress `data`, failing once output would exceed the limit.
pub fn decompress(
    encoding: Encoding,
    data: &[u8],
    limits: &DecompressionLimits,
) -> Result<Vec<u8>, TransformError> {
    let limit = limits.limit_for(data.len());
    match encoding {
        Encoding::Identity => Ok(data.to_vec()),
        Encoding::Gzip => read_limited(MultiGzDecoder::new(data), limit),
        Encoding::Deflate => read_limited(ZlibDecoder::new(data), limit),
        Encoding::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(data)
                .map_err(|e| TransformError::MalformedPayload(format!("zstd: {e}")))?;
            read_limited(decoder, limit)
        }
    }
}

fn read_limited<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    reader
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| TransformError::MalformedPayload(format!("corrupt compressed body: {e}")))?;

    if out.len() > limit {
        return Err(TransformError::DecompressionLimitExceeded { limit });
    }
    Ok(out)
}

/// Magic-byte sniffing for payloads that will not shrink further.
pub fn looks_compressed(data: &[u8]) -> bool {
    const SIGNATURES: &[&[u8]] = &[
        &[0x1f, 0x8b],             // gzip
        &[0x28, 0xb5, 0x2f, 0xfd], // zstd
        b"PK\x03\x04",             // zip
        b"\x89PNG",
        &[0xff, 0xd8, 0xff], // jpeg
        b"GIF8",
    ];
    if SIGNATURES.iter().any(|sig| data.starts_with(sig)) {
        return true;
    }
    data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP"
}
