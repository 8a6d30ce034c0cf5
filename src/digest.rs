//! Content digests.
//!
//! A [`Digest`] is the only basis for deciding that two registries hold the same content: equal
//! digests imply byte-identical manifests and blobs.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::Error;

/// An OCI content digest such as `sha256:e3b0c442...`.
///
/// The encoded part is kept in lowercase so that digests compare equal regardless of how a
/// registry chose to spell them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

fn invalid(digest: &str, reason: &str) -> Error {
    Error::InvalidDigest {
        digest: digest.to_string(),
        reason: reason.to_string(),
    }
}

impl Digest {
    /// Computes the sha256 digest of some bytes.
    pub fn sha256(bytes: &[u8]) -> Self {
        let mut context = Sha256::new();
        context.update(bytes);
        Digest {
            algorithm: "sha256".to_string(),
            encoded: hex::encode(context.finalize()),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// The tag under which cosign-style tooling stores attestations for this digest:
    /// `sha256-<hex>.att`.
    pub fn attestation_tag(&self) -> String {
        format!("{}-{}.att", self.algorithm, self.encoded)
    }

    /// Inverse of [`Digest::attestation_tag`].  Returns `None` for anything that isn't an
    /// attestation tag of a valid digest.
    pub fn from_attestation_tag(tag: &str) -> Option<Self> {
        let stem = tag.strip_suffix(".att")?;
        let (algorithm, encoded) = stem.split_once('-')?;
        format!("{algorithm}:{encoded}").parse().ok()
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(digest: &str) -> Result<Self, Error> {
        let Some((algorithm, encoded)) = digest.split_once(':') else {
            return Err(invalid(digest, "missing ':' separator"));
        };

        if algorithm.is_empty()
            || !algorithm
                .bytes()
                .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'+' | b'.' | b'_' | b'-'))
        {
            return Err(invalid(digest, "bad algorithm"));
        }

        let expected_len = match algorithm {
            "sha256" => Some(32),
            "sha512" => Some(64),
            _ => None,
        };

        let encoded = match expected_len {
            Some(len) => {
                let mut value = vec![0u8; len];
                hex::decode_to_slice(encoded, &mut value)
                    .map_err(|err| invalid(digest, &err.to_string()))?;
                hex::encode(value)
            }
            None => {
                if encoded.is_empty()
                    || !encoded
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'))
                {
                    return Err(invalid(digest, "bad encoded part"));
                }
                encoded.to_string()
            }
        };

        Ok(Digest {
            algorithm: algorithm.to_string(),
            encoded,
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> String {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256() {
        assert_eq!(Digest::sha256(b"").to_string(), EMPTY);
    }

    #[test]
    fn test_parse() {
        let digest: Digest = EMPTY.parse().unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.to_string(), EMPTY);

        // case is normalized away
        let upper: Digest = EMPTY.to_uppercase().replace("SHA256", "sha256").parse().unwrap();
        assert_eq!(upper, digest);

        fn assert_invalid(x: &str) {
            assert!(matches!(
                x.parse::<Digest>(),
                Err(Error::InvalidDigest { .. })
            ));
        }

        assert_invalid("");
        assert_invalid("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
        assert_invalid("sha256:e3b0c4");
        assert_invalid("sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85g");
        assert_invalid("SHA256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
        assert_invalid(":abc");
    }

    #[test]
    fn test_attestation_tag() {
        let digest: Digest = EMPTY.parse().unwrap();
        let tag = digest.attestation_tag();
        assert_eq!(
            tag,
            "sha256-e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855.att"
        );
        assert_eq!(Digest::from_attestation_tag(&tag), Some(digest));

        assert_eq!(Digest::from_attestation_tag("latest.att"), None);
        assert_eq!(Digest::from_attestation_tag("sha256-abc.att"), None);
        assert_eq!(
            Digest::from_attestation_tag(
                "sha256-e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855.sig"
            ),
            None
        );
    }

    #[test]
    fn test_serde() {
        let digest: Digest = serde_json::from_str(&format!("\"{EMPTY}\"")).unwrap();
        assert_eq!(serde_json::to_string(&digest).unwrap(), format!("\"{EMPTY}\""));
        assert!(serde_json::from_str::<Digest>("\"sha256:nope\"").is_err());
    }
}
