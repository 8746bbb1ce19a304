//! Component K: ABI dispatch + linking. Every submodule here (except
//! `linking`) is engine-agnostic: functions take `&mut Instance` plus
//! `&mut dyn MemoryView` and are unit-tested directly against
//! `FlatMemory`, the same way the component modules one level up are.
//! `linking` is the one wasmtime-specific file, a thin shim that fetches
//! the guest's `memory` export and dispatches into these functions.

pub mod body;
pub mod capabilities;
pub mod kv;
pub mod linking;
pub mod pending;
pub mod purge;
pub mod req;
pub mod resp;
pub mod stubs;
