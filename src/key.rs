//! Cache key derivation
//!
//! A [`CacheKey`] is the first 128 bits of a SHA-256 digest over a canonical,
//! length-prefixed encoding of `(source_id, operation, params)`. Parameters
//! live in a `BTreeMap`, so insertion order never affects the key, and numbers
//! are canonicalized so `30`, `30.0` and `30i32` all hash the same way.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Width of a cache key in bytes
pub const KEY_LEN: usize = 16;

/// Opaque fixed-length cache key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex form, as stored in the warm tier
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl FromStr for CacheKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for CacheKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Scalar request parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Canonical form: integral floats become `Int`, `-0.0` becomes `0`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn canonical(&self) -> Self {
        match self {
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Self::Int(*f as i64)
            }
            other => other.clone(),
        }
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        match self.canonical() {
            Self::Null => out.push(b'n'),
            Self::Bool(b) => {
                out.push(b'b');
                out.push(u8::from(b));
            }
            Self::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(&i.to_be_bytes());
            }
            Self::Float(f) => {
                out.push(b'f');
                // One bit pattern for every NaN
                let bits = if f.is_nan() { f64::NAN.to_bits() } else { f.to_bits() };
                out.extend_from_slice(&bits.to_be_bytes());
            }
            Self::Str(s) => {
                out.push(b's');
                write_str(out, &s);
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

macro_rules! param_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for ParamValue {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}

param_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Request parameters, sorted by name.
///
/// ```
/// use market_data_cache::Params;
///
/// let a = Params::new().with("symbol", "AAPL").with("days", 30);
/// let b = Params::new().with("days", 30.0).with("symbol", "AAPL");
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.canonical() == vb.canonical())
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Derives cache keys. Stateless; validation of parameters is the caller's job.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyCodec;

impl KeyCodec {
    /// Encode a logical request into its cache key
    #[must_use]
    pub fn encode(source_id: &str, operation: &str, params: &Params) -> CacheKey {
        let mut buf = Vec::with_capacity(64 + params.len() * 24);
        buf.extend_from_slice(b"mdc-key/1");
        write_str(&mut buf, source_id);
        write_str(&mut buf, operation);
        buf.extend_from_slice(&(params.len() as u64).to_be_bytes());
        for (name, value) in params.iter() {
            write_str(&mut buf, name);
            value.write_canonical(&mut buf);
        }

        let digest = Sha256::digest(&buf);
        let mut key = [0u8; KEY_LEN];
        for (dst, src) in key.iter_mut().zip(digest.iter()) {
            *dst = *src;
        }
        CacheKey(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_is_stable_and_hex_round_trips() {
        let params = Params::new().with("symbol", "MSFT").with("interval", "1d");
        let k1 = KeyCodec::encode("quotes", "history", &params);
        let k2 = KeyCodec::encode("quotes", "history", &params.clone());
        assert_eq!(k1, k2);

        let hex = k1.to_hex();
        assert_eq!(hex.len(), KEY_LEN * 2);
        assert_eq!(hex.parse::<CacheKey>().ok(), Some(k1));
    }

    #[test]
    fn test_numeric_canonicalization() {
        let a = KeyCodec::encode("s", "op", &Params::new().with("days", 30));
        let b = KeyCodec::encode("s", "op", &Params::new().with("days", 30.0));
        let c = KeyCodec::encode("s", "op", &Params::new().with("days", 30u8));
        let d = KeyCodec::encode("s", "op", &Params::new().with("days", -0.0).with("x", 1));
        let e = KeyCodec::encode("s", "op", &Params::new().with("days", 0).with("x", 1));
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(d, e);
    }

    #[test]
    fn test_string_case_is_preserved() {
        let upper = KeyCodec::encode("s", "op", &Params::new().with("symbol", "AAPL"));
        let lower = KeyCodec::encode("s", "op", &Params::new().with("symbol", "aapl"));
        assert_ne!(upper, lower);
    }

    #[test]
    fn test_fields_do_not_bleed_into_each_other() {
        // Without length prefixes these two would serialize identically
        let a = KeyCodec::encode("ab", "c", &Params::new());
        let b = KeyCodec::encode("a", "bc", &Params::new());
        assert_ne!(a, b);

        let c = KeyCodec::encode("s", "op", &Params::new().with("k", "1"));
        let d = KeyCodec::encode("s", "op", &Params::new().with("k", 1));
        assert_ne!(c, d);
    }

    proptest! {
        #[test]
        fn prop_param_order_does_not_change_key(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
        ) {
            let forward: Params = entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            let reverse: Params = entries.iter().rev().map(|(k, v)| (k.clone(), *v)).collect();
            prop_assert_eq!(
                KeyCodec::encode("src", "op", &forward),
                KeyCodec::encode("src", "op", &reverse)
            );
        }
    }
}
