//! # Vatrun ID-Types
//!
//! This library contains the swissnum types that identify things in the vatrun
//! ecosystem: vats, urbjects, powers and memories.
//!
//! A swissnum is an opaque, unforgeable string with a human-readable type
//! prefix. Apart from the vat identity (which is derived from the vat's public
//! key), every swissnum is minted from 256 bits of fresh randomness and never
//! reused. Knowing a swissnum *is* the authority to name the entity behind it,
//! which is why they only ever appear in stored power documents and never
//! inside guest-visible data.

use core::fmt;

use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of random bytes behind every minted swissnum.
const SWISS_RAW_LEN: usize = 32;

/// Error returned when a string does not parse as a swissnum of the expected type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid swissnum '{input}' - expected '{prefix}' prefix followed by base32")]
pub struct InvalidSwissnum {
    pub prefix: &'static str,
    pub input: String,
}

fn encode_swissnum(prefix: &str, raw: &[u8]) -> String {
    let mut s = String::with_capacity(prefix.len() + (raw.len() * 8).div_ceil(5));
    s.push_str(prefix);
    s.push_str(&BASE32_NOPAD.encode(raw).to_ascii_lowercase());
    s
}

fn check_swissnum(prefix: &'static str, input: &str) -> Result<(), InvalidSwissnum> {
    let invalid = || InvalidSwissnum {
        prefix,
        input: input.to_string(),
    };
    let rest = input.strip_prefix(prefix).ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }
    // lowercase RFC 4648 base32, no padding
    if !rest
        .chars()
        .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c))
    {
        return Err(invalid());
    }
    Ok(())
}

/// Generic macro to define the swissnum wrapper types.
macro_rules! impl_swissnum {
    ($type:ident, $prefix:literal) => {
        impl $type {
            /// Type prefix carried by every swissnum of this kind.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a fresh swissnum from 256 bits of randomness.
            pub fn generate() -> Self {
                let mut raw = [0u8; SWISS_RAW_LEN];
                rand::thread_rng().fill_bytes(&mut raw);
                $type(encode_swissnum($prefix, &raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn parse_str(s: &str) -> Result<Self, InvalidSwissnum> {
                check_swissnum($prefix, s)?;
                Ok($type(s.to_string()))
            }
        }

        impl TryFrom<&str> for $type {
            type Error = InvalidSwissnum;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                $type::parse_str(value)
            }
        }

        impl TryFrom<String> for $type {
            type Error = InvalidSwissnum;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                check_swissnum($prefix, &value)?;
                Ok($type(value))
            }
        }

        impl std::str::FromStr for $type {
            type Err = InvalidSwissnum;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $type::parse_str(s)
            }
        }

        impl fmt::Display for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$type> for String {
            fn from(value: $type) -> String {
                value.0
            }
        }

        impl From<&$type> for String {
            fn from(value: &$type) -> String {
                value.0.clone()
            }
        }

        impl AsRef<str> for $type {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<[u8]> for $type {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }
    };
}

/// The identity of a vat: its public key, rendered as a swissnum.
///
/// Two vats are the same vat exactly when their `VatId`s are equal. The id is
/// derived from the node's Ed25519 verifying key, so it can be checked against
/// the key that signs the vat's transport traffic.
///
/// Example:
/// ```sh
/// vat-mfrggzdfmztwq2lknnwg23tpobyxe43uov3ho6dzpjavcusl
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatId(String);
impl_swissnum!(VatId, "vat-");

impl VatId {
    /// Derives the vat identity from the node's verifying key.
    pub fn from_verifying_key(key: &ed25519_dalek::VerifyingKey) -> Self {
        VatId(encode_swissnum(Self::PREFIX, key.as_bytes()))
    }
}

/// Identifier of an urbject: an immutable `(code, power)` binding hosted by a vat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UrbjectId(String);
impl_swissnum!(UrbjectId, "urb-");

/// Identifier of a power: the stored authority document granted to an urbject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PowerId(String);
impl_swissnum!(PowerId, "pow-");

/// Identifier of a memory: a mutable JSON mapping persisted across turns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryId(String);
impl_swissnum!(MemoryId, "mem-");

/// A globally-qualified urbject address: `(vat, urbject)`.
///
/// Urbject references are always globally qualified, even when they point at
/// an urbject on the local vat. On the wire a refid is the two-element array
/// `[vatid, urbjid]`; on the command line it is the colon-joined "spid"
/// `vatid:urbjid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefId {
    pub vat: VatId,
    pub urbject: UrbjectId,
}

/// Error returned when a string does not parse as a `vatid:urbjid` spid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid spid '{0}' - expected 'vatid:urbjid'")]
pub struct InvalidSpid(pub String);

impl RefId {
    pub fn new(vat: VatId, urbject: UrbjectId) -> Self {
        RefId { vat, urbject }
    }

    /// Parses the colon-joined `vatid:urbjid` form.
    pub fn parse_spid(s: &str) -> Result<Self, InvalidSpid> {
        let (vat, urb) = s.split_once(':').ok_or_else(|| InvalidSpid(s.to_string()))?;
        let vat = VatId::parse_str(vat).map_err(|_| InvalidSpid(s.to_string()))?;
        let urbject = UrbjectId::parse_str(urb).map_err(|_| InvalidSpid(s.to_string()))?;
        Ok(RefId { vat, urbject })
    }

    pub fn to_spid(&self) -> String {
        format!("{}:{}", self.vat, self.urbject)
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vat, self.urbject)
    }
}

impl Serialize for RefId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        (&self.vat, &self.urbject).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RefId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (vat, urbject) = <(VatId, UrbjectId)>::deserialize(deserializer)?;
        Ok(RefId { vat, urbject })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swissnum_prefixes() {
        for _ in 0..1_000 {
            assert!(UrbjectId::generate().as_str().starts_with("urb-"));
            assert!(PowerId::generate().as_str().starts_with("pow-"));
            assert!(MemoryId::generate().as_str().starts_with("mem-"));
            assert!(VatId::generate().as_str().starts_with("vat-"));
        }
    }

    #[test]
    fn swissnums_are_unique() {
        // 256 bits of randomness must never collide in practice
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(MemoryId::generate()));
        }
    }

    #[test]
    fn parse_round_trip() {
        let urbjid = UrbjectId::generate();
        let parsed = UrbjectId::parse_str(urbjid.as_str()).unwrap();
        assert_eq!(urbjid, parsed);
    }

    #[test]
    fn reject_wrong_prefix() {
        let memid = MemoryId::generate();
        let res = UrbjectId::parse_str(memid.as_str());
        assert!(res.is_err(), "a memid must not parse as an urbjid");
    }

    #[test]
    fn reject_bad_charset() {
        assert!(MemoryId::parse_str("mem-NOT/base32!").is_err());
        assert!(MemoryId::parse_str("mem-").is_err());
    }

    #[test]
    fn serde_as_plain_string() {
        let powid = PowerId::generate();
        let json = serde_json::to_string(&powid).unwrap();
        assert_eq!(json, format!("\"{powid}\""));
        let back: PowerId = serde_json::from_str(&json).unwrap();
        assert_eq!(powid, back);
    }

    #[test]
    fn serde_rejects_forged_strings() {
        let res: Result<MemoryId, _> = serde_json::from_str("\"urb-abcdef234567\"");
        assert!(res.is_err());
    }

    #[test]
    fn refid_is_a_two_element_array() {
        let refid = RefId::new(VatId::generate(), UrbjectId::generate());
        let json = serde_json::to_string(&refid).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let arr = value.as_array().expect("refid must encode as an array");
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0].as_str().unwrap(), refid.vat.as_str());
        assert_eq!(arr[1].as_str().unwrap(), refid.urbject.as_str());
        let back: RefId = serde_json::from_str(&json).unwrap();
        assert_eq!(refid, back);
    }

    #[test]
    fn spid_round_trip() {
        let refid = RefId::new(VatId::generate(), UrbjectId::generate());
        let spid = refid.to_spid();
        assert_eq!(RefId::parse_spid(&spid).unwrap(), refid);
        assert!(RefId::parse_spid("no-colon-here").is_err());
        assert!(RefId::parse_spid("vat-abc:mem-def").is_err());
    }

    #[test]
    fn vat_id_from_key_is_stable() {
        let key = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        let a = VatId::from_verifying_key(&key.verifying_key());
        let b = VatId::from_verifying_key(&key.verifying_key());
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("vat-"));
    }
}
