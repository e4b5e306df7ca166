//! Wire identifiers: [`Identity`], [`ConnectionId`], [`Timestamp`], [`TimeDuration`].
//!
//! `Identity` is the one type here with two distinct textual/byte orderings:
//! the wire form is 32 bytes little-endian, while the conventional display
//! form is 64 hex characters in big-endian order. Round-tripping between the
//! two is a load-bearing invariant (property 3 in `spec.md`).

use crate::bsatn::{DecodeError, Deserialize, Deserializer, EncodeError, Serialize, Serializer};
use std::fmt;
use std::time::{Duration, SystemTime};

/// A 256-bit opaque principal identifying a connected user.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; 32]);

impl Identity {
    pub const ZERO: Identity = Identity([0; 32]);

    /// Build from the 32-byte little-endian wire representation.
    pub fn from_bytes_le(bytes: [u8; 32]) -> Self {
        Identity(bytes)
    }

    /// The 32-byte little-endian wire representation.
    pub fn to_bytes_le(self) -> [u8; 32] {
        self.0
    }

    /// Build from a big-endian byte array (the order `to_hex`/`from_hex` use).
    pub fn from_bytes_be(mut bytes: [u8; 32]) -> Self {
        bytes.reverse();
        Identity(bytes)
    }

    pub fn to_bytes_be(self) -> [u8; 32] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// Parse a 64-character hex string (big-endian byte order).
    pub fn from_hex(s: &str) -> Result<Self, IdentityParseError> {
        if s.len() != 64 {
            return Err(IdentityParseError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(IdentityParseError::InvalidHex)?;
        Ok(Self::from_bytes_be(bytes))
    }

    /// Render as a 64-character hex string (big-endian byte order).
    pub fn to_hex(self) -> String {
        hex::encode(self.to_bytes_be())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityParseError {
    #[error("expected 64 hex characters, got {0}")]
    WrongLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(hex::FromHexError),
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Identity {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_raw(&self.0);
        Ok(())
    }
}

impl Deserialize for Identity {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        let raw = de.get_raw(32)?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(raw);
        Ok(Identity(bytes))
    }
}

/// A 64-bit session-scoped connection identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnectionId(pub u64);

impl Serialize for ConnectionId {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_u64(self.0);
        Ok(())
    }
}

impl Deserialize for ConnectionId {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(ConnectionId(de.get_u64()?))
    }
}

/// Signed microseconds since the Unix epoch. Monotonically comparable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(dur.as_micros() as i64)
    }

    pub fn checked_add(self, dur: TimeDuration) -> Option<Timestamp> {
        self.0.checked_add(dur.0).map(Timestamp)
    }

    pub fn duration_since(self, other: Timestamp) -> TimeDuration {
        TimeDuration(self.0 - other.0)
    }
}

impl Serialize for Timestamp {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_i64(self.0);
        Ok(())
    }
}

impl Deserialize for Timestamp {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(Timestamp(de.get_i64()?))
    }
}

/// Signed nanoseconds, additive with [`Timestamp`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct TimeDuration(pub i64);

impl TimeDuration {
    pub fn from_duration(d: Duration) -> Self {
        TimeDuration(d.as_nanos() as i64)
    }

    pub fn to_std(self) -> Duration {
        Duration::from_nanos(self.0.max(0) as u64)
    }
}

impl Serialize for TimeDuration {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_i64(self.0);
        Ok(())
    }
}

impl Deserialize for TimeDuration {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(TimeDuration(de.get_i64()?))
    }
}

/// A 128-bit unsigned integer, little-endian on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct U128(pub u128);

impl Serialize for U128 {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_u128(self.0);
        Ok(())
    }
}

impl Deserialize for U128 {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(U128(de.get_u128()?))
    }
}

/// A 256-bit unsigned integer, stored as four `u64` limbs (least-significant
/// first) and little-endian on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct U256(pub [u64; 4]);

impl Serialize for U256 {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_u256(self.0);
        Ok(())
    }
}

impl Deserialize for U256 {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(U256(de.get_u256()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsatn;

    #[test]
    fn identity_hex_round_trip() {
        let bytes_be: [u8; 32] = std::array::from_fn(|i| i as u8);
        let hex = hex::encode(bytes_be);
        let id = Identity::from_hex(&hex).unwrap();
        assert_eq!(id.to_hex(), hex);
    }

    #[test]
    fn identity_le_round_trip() {
        let bytes_le: [u8; 32] = std::array::from_fn(|i| (31 - i) as u8);
        let id = Identity::from_bytes_le(bytes_le);
        assert_eq!(id.to_bytes_le(), bytes_le);
    }

    #[test]
    fn identity_le_be_are_reversed() {
        let bytes_le: [u8; 32] = std::array::from_fn(|i| i as u8);
        let id = Identity::from_bytes_le(bytes_le);
        let mut expected_be = bytes_le;
        expected_be.reverse();
        assert_eq!(id.to_bytes_be(), expected_be);
    }

    #[test]
    fn identity_wire_encoding_is_le() {
        let bytes_le: [u8; 32] = std::array::from_fn(|i| i as u8);
        let id = Identity::from_bytes_le(bytes_le);
        assert_eq!(bsatn::to_vec(&id).unwrap(), bytes_le.to_vec());
    }

    #[test]
    fn timestamp_round_trip() {
        let ts = Timestamp(1_234_567_890);
        let bytes = bsatn::to_vec(&ts).unwrap();
        assert_eq!(bsatn::from_slice::<Timestamp>(&bytes).unwrap(), ts);
    }

    #[test]
    fn u128_u256_round_trip() {
        let v = U128(u128::MAX / 3);
        assert_eq!(bsatn::from_slice::<U128>(&bsatn::to_vec(&v).unwrap()).unwrap(), v);
        let v = U256([1, 2, 3, 4]);
        assert_eq!(bsatn::from_slice::<U256>(&bsatn::to_vec(&v).unwrap()).unwrap(), v);
    }
}
