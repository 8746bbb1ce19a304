//! Host-side ABI runtime for Fastly Compute@Edge-style WebAssembly
//! programs: a flat `env`-module import table operating on opaque u32
//! handles and linear-memory pointers, bound to `wasmtime` in
//! [`abi::linking`] and driven end to end by [`driver`].

pub mod abi;
pub mod backend;
pub mod body;
pub mod capabilities;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod framing;
pub mod handles;
pub mod headers;
pub mod instance;
pub mod kv;
pub mod memory;
pub mod multivalue;
pub mod oneshot;
pub mod purge;
pub mod request;
pub mod response;
pub mod status;
pub mod subrequest;
pub mod version;

pub use error::XqdError;
pub use instance::{Host, Instance};
pub use status::XqdStatus;
