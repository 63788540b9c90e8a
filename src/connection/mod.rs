//! The connection to a bus: handle, builder and the engine task behind
//! them.

pub use self::connection::{CallOptions, Connection, MatchGuard, ReturnValue};
mod connection;

pub use self::builder::ConnectionBuilder;
mod builder;

pub(crate) use self::engine::Engine;
mod engine;

#[cfg(test)]
mod tests;
