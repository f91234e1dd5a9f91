//! Client-side stubs for the services a chunk server talks to.

pub mod meta_stub;

pub use meta_stub::{IMetaServerStub, MockMetaServerStub};
