//! Client-facing event layer.
//!
//! Transport is left to the server crate; this module only defines the
//! JSON event protocol and routes decoded events to rooms.

/// Routing from connections to room actors.
pub mod gateway;

/// Event types for the client-server protocol.
pub mod messages;
