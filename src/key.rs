//! Cache key derivation
//!
//! A key is the JSON serialization of the ordered argument tuple of a call.
//! Arguments go through [`serde_json::Value`] first, whose object map keeps
//! keys sorted, so map-valued arguments yield the same key regardless of
//! their iteration order.
//!
//! JSON has no representation for NaN or the infinities and `serde_json`
//! writes them as `null`, which would conflate them with `None`. Arguments are
//! therefore walked once with [`FiniteFloats`] before serialization and
//! non-finite floats are rejected.

use serde::{
    Serialize,
    ser::{self, Error as _},
};
use std::fmt;

use crate::CacheError;

/// Serialized argument tuple identifying one cached result within a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for an argument tuple.
    ///
    /// Pass arguments positionally as a tuple, e.g. `("org1", "case42")`.
    /// Fails with [`CacheError::InvalidCacheKey`] when the arguments cannot be
    /// serialized deterministically.
    pub fn from_args<A>(args: &A) -> Result<Self, CacheError>
    where
        A: Serialize + ?Sized,
    {
        args.serialize(FiniteFloats)?;
        let value = serde_json::to_value(args)?;
        Ok(CacheKey(serde_json::to_string(&value)?))
    }

    /// The serialized key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serializer that produces nothing and fails on the first non-finite float
#[derive(Clone, Copy)]
struct FiniteFloats;

type CheckResult = Result<(), serde_json::Error>;

macro_rules! accept_scalars {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method(self, _v: $ty) -> CheckResult {
                Ok(())
            }
        )*
    };
}

fn check_float(v: f64) -> CheckResult {
    if v.is_finite() {
        Ok(())
    } else {
        Err(serde_json::Error::custom(format!(
            "non-finite float {v} cannot be part of a cache key"
        )))
    }
}

impl ser::Serializer for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    accept_scalars! {
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_i128: i128,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_u128: u128,
        serialize_char: char,
        serialize_str: &str,
        serialize_bytes: &[u8],
        serialize_unit_struct: &'static str,
    }

    fn serialize_f32(self, v: f32) -> CheckResult {
        check_float(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> CheckResult {
        check_float(v)
    }

    fn serialize_none(self) -> CheckResult {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> CheckResult {
        value.serialize(self)
    }

    fn serialize_unit(self) -> CheckResult {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> CheckResult {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, serde_json::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> CheckResult {
        value.serialize(*self)
    }

    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> CheckResult {
        value.serialize(*self)
    }

    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> CheckResult {
        value.serialize(*self)
    }

    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> CheckResult {
        value.serialize(*self)
    }

    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> CheckResult {
        key.serialize(*self)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> CheckResult {
        value.serialize(*self)
    }

    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(*self)
    }

    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(*self)
    }

    fn end(self) -> CheckResult {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::{Error as _, Serializer};
    use std::collections::HashMap;

    #[test]
    fn test_positional_key() {
        let key = CacheKey::from_args(&("org1", "case42")).unwrap();
        assert_eq!(key.as_str(), r#"["org1","case42"]"#);

        // Argument order matters
        let swapped = CacheKey::from_args(&("case42", "org1")).unwrap();
        assert_ne!(key, swapped);
    }

    #[test]
    fn test_equivalent_calls_share_key() {
        let a = CacheKey::from_args(&("org1".to_owned(), 42u32)).unwrap();
        let b = CacheKey::from_args(&("org1", 42u64)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_map_arguments_are_order_independent() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for i in 0..32 {
            first.insert(format!("k{i}"), i);
        }
        for i in (0..32).rev() {
            second.insert(format!("k{i}"), i);
        }

        assert_eq!(
            CacheKey::from_args(&("x", &first)).unwrap(),
            CacheKey::from_args(&("x", &second)).unwrap()
        );
    }

    #[test]
    fn test_non_string_map_keys_are_rejected() {
        let mut map = HashMap::new();
        map.insert(vec![1u8], "value");

        let err = CacheKey::from_args(&(map,)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidCacheKey(_)));
    }

    #[test]
    fn test_failing_serializer_is_rejected() {
        struct Unserializable;

        impl Serialize for Unserializable {
            fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
                Err(S::Error::custom("cannot serialize"))
            }
        }

        let err = CacheKey::from_args(&("org1", Unserializable)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidCacheKey(_)));
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = CacheKey::from_args(&("org1", bad)).unwrap_err();
            assert!(matches!(err, CacheError::InvalidCacheKey(_)));
        }

        // Nested and single-precision values are checked too
        assert!(CacheKey::from_args(&(vec![1.0f32, f32::NAN],)).is_err());
        assert!(CacheKey::from_args(&(Some(f64::INFINITY),)).is_err());
        let mut map = HashMap::new();
        map.insert("weight", f64::NAN);
        assert!(CacheKey::from_args(&(map,)).is_err());

        // `None` still keys as null and finite floats are unaffected
        let none = CacheKey::from_args(&(None::<f64>,)).unwrap();
        assert_eq!(none.as_str(), "[null]");
        let finite = CacheKey::from_args(&(1.5f64, -0.25f32)).unwrap();
        assert_eq!(finite.as_str(), "[1.5,-0.25]");
    }
}
