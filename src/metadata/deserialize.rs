use alloc::string::ToString;

use serde::de::value::StrDeserializer;
use serde::de::{self, Error as _};
use serde::{forward_to_deserialize_any, Deserialize};

use super::value::{Section, Value};
use super::Error;

type DeError = de::value::Error;

/// Deserializes any `serde` type out of a metadata section.
///
/// Keys map to struct fields, nested sections to nested structs or maps,
/// arrays to sequences or tuples. Unknown keys are ignored unless the target
/// type asks for them.
pub fn from_section<'a, T: Deserialize<'a>>(section: &'a Section) -> Result<T, Error> {
    T::deserialize(section).map_err(|e| Error::UnexpectedShape { path: "".into(), problem: e.to_string() })
}

/// Like [`from_section`], for any node of the tree.
pub fn from_value<'a, T: Deserialize<'a>>(value: &'a Value) -> Result<T, Error> {
    T::deserialize(value).map_err(|e| Error::UnexpectedShape { path: "".into(), problem: e.to_string() })
}

impl<'de, 'a> de::Deserializer<'de> for &'a Section {
    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }

    type Error = DeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de> {
        visitor.visit_map(SectionAccess { entries: self.iter(), current: None })
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de> {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de> {
        visitor.visit_newtype_struct(self)
    }
}

struct SectionAccess<'a, I> {
    entries: I,
    current: Option<(&'a str, &'a Value)>,
}

impl<'de, 'a, I> de::MapAccess<'de> for SectionAccess<'a, I>
where
    I: Iterator<Item = (&'a str, &'a Value)>,
{
    type Error = DeError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: de::DeserializeSeed<'de> {
        match self.entries.next() {
            None => Ok(None),
            Some((name, value)) => {
                self.current = Some((name, value));
                seed.deserialize(StrDeserializer::new(name)).map(Some)
            }
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: de::DeserializeSeed<'de> {
        let (name, value) = self.current.take().ok_or_else(|| DeError::custom("value requested before its key"))?;
        seed.deserialize(value).map_err(|e| DeError::custom(format_args!("{name}: {e}")))
    }
}

impl<'de, 'a> de::Deserializer<'de> for &'a Value {
    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }

    type Error = DeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de> {
        match self {
            Value::String(s) => visitor.visit_str(s),
            &Value::Integer(n) => visitor.visit_u64(n),
            &Value::Float(n) => visitor.visit_f64(n),
            Value::Array(a) => visitor.visit_seq(ValuesAccess(a.iter())),
            Value::Section(s) => de::Deserializer::deserialize_any(s, visitor),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de> {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de> {
        visitor.visit_newtype_struct(self)
    }
}

struct ValuesAccess<'a>(core::slice::Iter<'a, Value>);

impl<'de, 'a> de::SeqAccess<'de> for ValuesAccess<'a> {
    type Error = DeError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: de::DeserializeSeed<'de> {
        match self.0.next() {
            None => Ok(None),
            Some(x) => seed.deserialize(x).map(Some),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}
