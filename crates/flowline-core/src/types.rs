use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

/// Named variables of a data container
pub type Variables = HashMap<String, DataPacket>;

/// A value flowing through the engine: variables, expression results,
/// connector inputs and outputs.
///
/// This is a wrapper around a JSON value with some helper methods.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DataPacket {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl DataPacket {
    /// Create a new data packet from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Create a null data packet
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Check if the data packet is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Try to convert the data packet to a string
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Try to convert the data packet to a boolean
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    /// Try to read the data packet as a non-negative integer.
    ///
    /// Whole floats (`3.0`) are accepted since expression languages rarely
    /// distinguish them from integers.
    pub fn as_u64(&self) -> Option<u64> {
        if let Some(n) = self.value.as_u64() {
            return Some(n);
        }
        match self.value.as_f64() {
            Some(f) if f >= 0.0 && f.fract() == 0.0 => Some(f as u64),
            _ => None,
        }
    }

    /// Try to convert the data packet to an array
    #[inline]
    pub fn as_array(&self) -> Option<&Vec<serde_json::Value>> {
        self.value.as_array()
    }

    /// Try to convert the data packet to a specific type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Create a data packet from a serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Create a data packet from a boolean
    #[inline]
    pub fn from_bool(b: bool) -> Self {
        Self::new(serde_json::Value::Bool(b))
    }

    /// Create a data packet from an unsigned integer
    #[inline]
    pub fn from_u64(n: u64) -> Self {
        Self::new(serde_json::Value::from(n))
    }
}

impl From<serde_json::Value> for DataPacket {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}
