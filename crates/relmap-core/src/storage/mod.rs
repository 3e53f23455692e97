//! Connection layer for relmap.
//!
//! The compiler never talks to a driver directly: queries and batches go through the
//! [`Connection`] and [`AsyncConnection`] traits, and [`RelationalDatabase`] ties a
//! model, a dialect and the caches together.

mod connection;
mod database;

pub use connection::{
    AsyncConnection, BufferedRows, Cancellation, Connection, RowReader, RowStream,
    ScriptedConnection,
};
pub use database::RelationalDatabase;
