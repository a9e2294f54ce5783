//! courier: length-framed, JSON-header TCP messaging.
//!
//! The facade crate: re-exports the full public surface of `courier-core`
//! (server, client, settings, events, errors) and the wire types from
//! `courier-protocol`.

pub use courier_core::*;
