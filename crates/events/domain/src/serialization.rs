//! Event JSON Serialization
//!
//! Encoding always uses the event's runtime type. Decoding can match JSON
//! property names case-insensitively, which keeps rows written by older
//! producers (PascalCase properties) readable from the event log.

use serde::de::{self, DeserializeOwned, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::Serialize;
use serde_json::{Map, Value};

/// Process-wide JSON options held by the subscription registry.
#[derive(Debug, Clone)]
pub struct JsonOptions {
    /// Write indented JSON. The event log always stores indented content.
    pub write_indented: bool,
    /// Match object keys to struct fields ignoring ASCII case on decode.
    pub case_insensitive_properties: bool,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            write_indented: false,
            case_insensitive_properties: true,
        }
    }
}

impl JsonOptions {
    /// Options used for event log content.
    pub fn indented() -> Self {
        Self {
            write_indented: true,
            case_insensitive_properties: true,
        }
    }
}

/// Encode an event (or any serde value) with the given options.
pub fn serialize<E>(event: &E, options: &JsonOptions) -> Result<Vec<u8>, serde_json::Error>
where
    E: Serialize + ?Sized,
{
    if options.write_indented {
        serde_json::to_vec_pretty(event)
    } else {
        serde_json::to_vec(event)
    }
}

/// Decode an event of a known type with the given options.
pub fn deserialize<T>(bytes: &[u8], options: &JsonOptions) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned,
{
    if options.case_insensitive_properties {
        let value: Value = serde_json::from_slice(bytes)?;
        T::deserialize(CaseInsensitiveDeserializer(value))
    } else {
        serde_json::from_slice(bytes)
    }
}

/// Deserializer over a parsed [`Value`] that matches struct field names
/// ignoring ASCII case, at every nesting level.
///
/// serde hands the expected field list to `deserialize_struct`, so incoming
/// keys can be canonicalized before the derived visitor sees them. Sequences
/// and plain maps keep the wrapper so nested structs stay case-insensitive.
struct CaseInsensitiveDeserializer(Value);

impl<'de> de::Deserializer<'de> for CaseInsensitiveDeserializer {
    type Error = serde_json::Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Object(map) => visitor.visit_map(CaseInsensitiveMap::new(map, &[])),
            Value::Array(values) => visitor.visit_seq(CaseInsensitiveSeq::new(values)),
            other => other.deserialize_any(visitor),
        }
    }

    fn deserialize_struct<V>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Object(map) => visitor.visit_map(CaseInsensitiveMap::new(map, fields)),
            other => other.deserialize_struct(name, fields, visitor),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Null => visitor.visit_none(),
            value => visitor.visit_some(CaseInsensitiveDeserializer(value)),
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_enum(name, variants, visitor)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map identifier
        ignored_any
    }
}

struct CaseInsensitiveMap {
    entries: serde_json::map::IntoIter,
    fields: &'static [&'static str],
    value: Option<Value>,
}

impl CaseInsensitiveMap {
    fn new(map: Map<String, Value>, fields: &'static [&'static str]) -> Self {
        Self {
            entries: map.into_iter(),
            fields,
            value: None,
        }
    }
}

impl<'de> MapAccess<'de> for CaseInsensitiveMap {
    type Error = serde_json::Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: DeserializeSeed<'de>,
    {
        let Some((key, value)) = self.entries.next() else {
            return Ok(None);
        };
        self.value = Some(value);
        let canonical = self
            .fields
            .iter()
            .find(|field| field.eq_ignore_ascii_case(&key))
            .map(|field| (*field).to_string())
            .unwrap_or(key);
        seed.deserialize(Value::String(canonical)).map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: DeserializeSeed<'de>,
    {
        match self.value.take() {
            Some(value) => seed.deserialize(CaseInsensitiveDeserializer(value)),
            None => Err(de::Error::custom("map value requested before its key")),
        }
    }
}

struct CaseInsensitiveSeq {
    values: std::vec::IntoIter<Value>,
}

impl CaseInsensitiveSeq {
    fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
        }
    }
}

impl<'de> SeqAccess<'de> for CaseInsensitiveSeq {
    type Error = serde_json::Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: DeserializeSeed<'de>,
    {
        match self.values.next() {
            Some(value) => seed.deserialize(CaseInsensitiveDeserializer(value)).map(Some),
            None => Ok(None),
        }
    }
}
