//! SQL commands handed to the connection.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::error::Error;
use crate::value::Value;

/// A named parameter bound to a command.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct SqlParameter {
    /// Parameter name including the dialect prefix (e.g. `@p0`).
    pub name: String,
    /// Bound value.
    pub value: Value,
}

impl SqlParameter {
    /// Create a new parameter.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// SQL text plus its bound parameters.
///
/// This is the unit of work the connection executes: either a query returning one row
/// stream or a batch returning result sets and an affected-row count.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Default,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct SqlCommand {
    /// Statement text.
    pub text: String,
    /// Parameters in binding order.
    pub parameters: Vec<SqlParameter>,
}

impl SqlCommand {
    /// Create a command without parameters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    /// Add a parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push(SqlParameter::new(name, value));
        self
    }

    /// Bind a parameter, rejecting duplicate names.
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), Error> {
        let name = name.into();
        if self.parameter(&name).is_some() {
            return Err(Error::DuplicateParameter(name));
        }
        self.parameters.push(SqlParameter::new(name, value));
        Ok(())
    }

    /// Look up a parameter value by name.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    /// Encode for a remote connection.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a command produced by [`SqlCommand::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_rejects_duplicates() {
        let mut command = SqlCommand::new("SELECT 1");
        command.bind("@p0", 1).unwrap();
        let err = command.bind("@p0", 2).unwrap_err();
        assert!(matches!(err, Error::DuplicateParameter(name) if name == "@p0"));
        assert_eq!(command.parameter("@p0"), Some(&Value::Int32(1)));
    }

    #[test]
    fn test_command_wire_roundtrip() {
        let command = SqlCommand::new("INSERT INTO [Ducks] ([Name]) VALUES (@p0);")
            .with_parameter("@p0", "Mallard");
        let bytes = command.to_bytes().unwrap();
        assert_eq!(SqlCommand::from_bytes(&bytes).unwrap(), command);
    }
}
