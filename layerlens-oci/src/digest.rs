use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::{OciError, Result};

/// A content digest of the form `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse `sha256:abcd...`. The hex part must be non-empty lowercase hex.
    /// Unknown algorithms parse fine; they only fail at verification time.
    pub fn parse(raw: &str) -> Result<Self> {
        let (algorithm, hex) = raw
            .split_once(':')
            .ok_or_else(|| OciError::UnsupportedDigest(format!("malformed digest: {raw}")))?;
        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        {
            return Err(OciError::UnsupportedDigest(format!(
                "malformed algorithm in {raw}"
            )));
        }
        if hex.len() < 2 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(OciError::UnsupportedDigest(format!(
                "malformed hex in {raw}"
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// SHA-256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            hex: hex_encode(&Sha256::digest(data)),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Start an incremental verification of bytes claimed to hash to `self`.
    pub fn verifier(&self) -> Result<DigestVerifier> {
        match self.algorithm.as_str() {
            "sha256" => Ok(DigestVerifier {
                expected: self.clone(),
                hasher: Sha256::new(),
            }),
            other => Err(OciError::UnsupportedDigest(format!(
                "unsupported digest algorithm: {other}"
            ))),
        }
    }

    /// Verify a complete in-memory buffer.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let mut verifier = self.verifier()?;
        verifier.update(data);
        verifier.finish()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Streaming hash check.
pub struct DigestVerifier {
    expected: Digest,
    hasher: Sha256,
}

impl DigestVerifier {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> Result<()> {
        let actual = hex_encode(&self.hasher.finalize());
        if actual != self.expected.hex {
            return Err(OciError::DigestMismatch {
                expected: self.expected.to_string(),
                actual: format!("{}:{}", self.expected.algorithm, actual),
            });
        }
        Ok(())
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
