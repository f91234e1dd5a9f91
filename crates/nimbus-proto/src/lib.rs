//! Request/response types for the ops a chunk server exchanges with the
//! meta server.

pub mod chunk_server;

pub use chunk_server::*;
