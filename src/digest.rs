//! Content digests.
//!
//! A digest is the `<algorithm>:<hex>` identity of a blob. Only sha256 is
//! produced by this store; sha512 digests parse so that foreign layouts can
//! still be read.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, StoreError};

/// Registered digest algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded digest value.
    fn encoded_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }
}

/// A validated content digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    encoded: String,
}

impl Digest {
    /// Compute the sha256 digest of a byte slice.
    pub fn sha256_from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);

        Self {
            algorithm: DigestAlgorithm::Sha256,
            encoded: hex::encode(hasher.finalize()),
        }
    }

    /// Compute the sha256 digest of a stream, returning the digest and the
    /// number of bytes read.
    pub async fn sha256_from_reader<R>(reader: &mut R) -> Result<(Self, u64)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        let mut buf = [0u8; 8192];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }

        Ok((
            Self {
                algorithm: DigestAlgorithm::Sha256,
                encoded: hex::encode(hasher.finalize()),
            },
            total,
        ))
    }

    /// Build a digest from an algorithm and a hex value, validating both.
    pub fn from_encoded(algorithm: DigestAlgorithm, encoded: &str) -> Result<Self> {
        if encoded.len() != algorithm.encoded_len()
            || !encoded.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(StoreError::InvalidDigest(format!(
                "{}:{}",
                algorithm.as_str(),
                encoded
            )));
        }

        Ok(Self {
            algorithm,
            encoded: encoded.to_string(),
        })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The hex-encoded value, without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, encoded) = s
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidDigest(s.to_string()))?;

        let algorithm = match algo {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            _ => return Err(StoreError::InvalidDigest(s.to_string())),
        };

        Self::from_encoded(algorithm, encoded)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.encoded)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
