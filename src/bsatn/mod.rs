//! Binary encoding for the Algebraic Type Notation (ATN) used on the wire.
//!
//! The format is schema-agnostic: callers encode and decode fields in
//! declaration order, and the codec itself never inspects a type's shape.
//! Generated code (out of scope for this crate) is what supplies structure
//! by calling these primitives in the right order.

pub mod de;
pub mod ser;

pub use de::{DecodeError, Deserializer};
pub use ser::{EncodeError, Serializer};

/// Implemented by any value that can be written field-by-field to the wire.
pub trait Serialize {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError>;
}

/// Implemented by any value that can be read field-by-field from the wire.
pub trait Deserialize: Sized {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError>;
}

/// Encode `value` into a freshly-allocated byte buffer.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut ser = Serializer::new();
    value.serialize(&mut ser)?;
    Ok(ser.into_inner())
}

/// Decode a `T` from the start of `bytes`, requiring the whole slice be consumed.
pub fn from_slice<T: Deserialize>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut de = Deserializer::new(bytes);
    let value = T::deserialize(&mut de)?;
    de.expect_exhausted()?;
    Ok(value)
}

/// Decode a `T` from the start of `bytes`, returning the value and the
/// number of bytes consumed. Used when a caller has more data to read after
/// this value (e.g. a tagged-union payload embedded in a larger message).
pub fn take_from_slice<T: Deserialize>(bytes: &[u8]) -> Result<(T, usize), DecodeError> {
    let mut de = Deserializer::new(bytes);
    let value = T::deserialize(&mut de)?;
    Ok((value, de.position()))
}

macro_rules! impl_prim {
    ($ty:ty, $put:ident, $get:ident) => {
        impl Serialize for $ty {
            fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
                ser.$put(*self);
                Ok(())
            }
        }
        impl Deserialize for $ty {
            fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
                de.$get()
            }
        }
    };
}

impl_prim!(bool, put_bool, get_bool);
impl_prim!(u8, put_u8, get_u8);
impl_prim!(u16, put_u16, get_u16);
impl_prim!(u32, put_u32, get_u32);
impl_prim!(u64, put_u64, get_u64);
impl_prim!(i8, put_i8, get_i8);
impl_prim!(i16, put_i16, get_i16);
impl_prim!(i32, put_i32, get_i32);
impl_prim!(i64, put_i64, get_i64);
impl_prim!(u128, put_u128, get_u128);
impl_prim!(f32, put_f32, get_f32);
impl_prim!(f64, put_f64, get_f64);

impl Serialize for String {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_string(self)
    }
}
impl Deserialize for String {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        de.get_string()
    }
}

impl Serialize for Box<str> {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_string(self)
    }
}
impl Deserialize for Box<str> {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        de.get_string().map(String::into_boxed_str)
    }
}

impl Serialize for Vec<u8> {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_bytes(self)
    }
}
impl Deserialize for Vec<u8> {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        de.get_bytes().map(|b| b.to_vec())
    }
}

impl Serialize for bytes::Bytes {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_bytes(self)
    }
}
impl Deserialize for bytes::Bytes {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        de.get_bytes().map(bytes::Bytes::copy_from_slice)
    }
}

impl<T: Serialize> Serialize for Option<T> {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        match self {
            None => ser.put_u8(0),
            Some(v) => {
                ser.put_u8(1);
                v.serialize(ser)?;
            }
        }
        Ok(())
    }
}
impl<T: Deserialize> Deserialize for Option<T> {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        match de.get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::deserialize(de)?)),
            tag => Err(DecodeError::InvalidData(format!("bad optional tag {tag}"))),
        }
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_len(self.len())?;
        for item in self {
            item.serialize(ser)?;
        }
        Ok(())
    }
}
impl<T: Deserialize> Deserialize for Vec<T> {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        let len = de.get_len()?;
        let mut out = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            out.push(T::deserialize(de)?);
        }
        Ok(out)
    }
}

impl<T: Serialize> Serialize for Box<[T]> {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_len(self.len())?;
        for item in self.iter() {
            item.serialize(ser)?;
        }
        Ok(())
    }
}
impl<T: Deserialize> Deserialize for Box<[T]> {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Vec::<T>::deserialize(de).map(Vec::into_boxed_slice)
    }
}
