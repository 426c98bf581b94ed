// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Compression
//!
//! Outbound payloads may be compressed with gzip or deflate; the algorithm
//! name travels in the `content-encoding` property so consumers know how to
//! decode the body.

use crate::errors::AmqpError;
use flate2::{
    read::{DeflateDecoder, GzDecoder},
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use std::{
    fmt,
    io::{Read, Write},
    str::FromStr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Gzip,
    Deflate,
}

impl CompressionAlgorithm {
    /// Value carried in the `content-encoding` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Deflate => "deflate",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, AmqpError> {
        let result = match self {
            CompressionAlgorithm::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).and_then(|_| enc.finish())
            }
            CompressionAlgorithm::Deflate => {
                let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).and_then(|_| enc.finish())
            }
        };

        result.map_err(|err| AmqpError::PublishingError(format!("{} compression: {}", self, err)))
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, AmqpError> {
        let mut out = Vec::new();
        let result = match self {
            CompressionAlgorithm::Gzip => GzDecoder::new(data).read_to_end(&mut out),
            CompressionAlgorithm::Deflate => DeflateDecoder::new(data).read_to_end(&mut out),
        };

        result
            .map(|_| out)
            .map_err(|err| AmqpError::UnsupportedEncoding(self.as_str().to_owned(), err.to_string()))
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(CompressionAlgorithm::Gzip),
            "deflate" => Ok(CompressionAlgorithm::Deflate),
            other => Err(AmqpError::UnsupportedCompression(other.to_owned())),
        }
    }
}

/// Decodes a body according to its `content-encoding`. A missing encoding
/// (or `identity`) leaves the body untouched.
pub fn decode_body(content_encoding: Option<&str>, data: &[u8]) -> Result<Vec<u8>, AmqpError> {
    match content_encoding {
        None | Some("") | Some("identity") => Ok(data.to_vec()),
        Some(encoding) => {
            let algorithm = CompressionAlgorithm::from_str(encoding).map_err(|_| {
                AmqpError::UnsupportedEncoding(encoding.to_owned(), "unknown algorithm".to_owned())
            })?;
            algorithm.decompress(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_payload_decodes_through_content_encoding() {
        let body = br#"{"order_id":"o-1"}"#;
        let compressed = CompressionAlgorithm::Gzip.compress(body).unwrap();

        assert_ne!(compressed.as_slice(), body.as_slice());
        assert_eq!(decode_body(Some("gzip"), &compressed).unwrap(), body.to_vec());
    }

    #[test]
    fn deflate_payload_decodes_through_content_encoding() {
        let body = b"hello hello hello hello";
        let compressed = CompressionAlgorithm::Deflate.compress(body).unwrap();

        assert_eq!(decode_body(Some("deflate"), &compressed).unwrap(), body.to_vec());
    }

    #[test]
    fn rejects_unknown_algorithms() {
        assert_eq!(
            "br".parse::<CompressionAlgorithm>(),
            Err(AmqpError::UnsupportedCompression("br".to_owned()))
        );
        assert!(matches!(
            decode_body(Some("br"), b"x"),
            Err(AmqpError::UnsupportedEncoding(enc, _)) if enc == "br"
        ));
    }

    #[test]
    fn corrupt_body_is_an_encoding_error() {
        assert!(matches!(
            decode_body(Some("gzip"), b"not gzip at all"),
            Err(AmqpError::UnsupportedEncoding(_, _))
        ));
    }

    #[test]
    fn identity_passes_through() {
        assert_eq!(decode_body(None, b"raw").unwrap(), b"raw".to_vec());
    }
}
