//! relmap protocol types.
//!
//! This crate defines the contract between the query/update compiler and the
//! connection collaborator: values, SQL commands with named parameters, and the
//! result sets a connection hands back.
//!
//! # Modules
//!
//! - [`value`] - Runtime values for parameters and result cells
//! - [`command`] - SQL text plus bound parameters
//! - [`result`] - Result sets and batch outcomes
//! - [`error`] - Protocol error types
//!
//! # Serialization
//!
//! All types derive `rkyv::Archive`, `rkyv::Serialize` and `rkyv::Deserialize` so a
//! remote connection can ship them without copying, and `serde` for diagnostics:
//!
//! ```ignore
//! use relmap_proto::SqlCommand;
//!
//! let command = SqlCommand::new("SELECT 1");
//! let bytes = command.to_bytes()?;
//! let decoded = SqlCommand::from_bytes(&bytes)?;
//! ```

pub mod command;
pub mod error;
pub mod result;
pub mod value;

pub use command::{SqlCommand, SqlParameter};
pub use error::Error;
pub use result::{BatchResult, ResultSet};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_roundtrip() {
        let value = Value::String("hello".into());
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&value).unwrap();
        let archived =
            rkyv::access::<value::ArchivedValue, rkyv::rancor::Error>(&bytes).unwrap();
        let deserialized: Value =
            rkyv::deserialize::<Value, rkyv::rancor::Error>(archived).unwrap();
        assert_eq!(value, deserialized);
    }

    #[test]
    fn test_batch_result_roundtrip() {
        let result = BatchResult::affected(2).with_result_set(
            ResultSet::new(["Id"])
                .with_row(vec![Value::Int32(1)])
                .unwrap()
                .with_row(vec![Value::Int32(2)])
                .unwrap(),
        );

        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&result).unwrap();
        let archived =
            rkyv::access::<result::ArchivedBatchResult, rkyv::rancor::Error>(&bytes).unwrap();
        let deserialized: BatchResult =
            rkyv::deserialize::<BatchResult, rkyv::rancor::Error>(archived).unwrap();
        assert_eq!(result, deserialized);
    }
}
