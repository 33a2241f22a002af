//! WebSocket front end for the stake pile engine.
//!
//! The binary wires these modules together; they are exposed as a library
//! so integration tests can build the router without a listening socket.

pub mod api;
pub mod config;
pub mod logging;
pub mod metrics;
