//! The J* runtime core: value representation, garbage-collected heap,
//! bytecode dispatch loop, closures with shared upvalues, exception
//! unwinding with `try`/`except`/`ensure`, the module/import pipeline, and
//! the embedding API hosts drive it all through.
//!
//! The compiler front-end is an external collaborator plugged in through
//! [`vm::CompilerFn`]; the standard library is a set of native-function
//! registrations bound at module load time through
//! [`vm::VirtualMachine::register_native`].

mod api;
pub mod buffer;
pub mod core;
pub(crate) mod trace;
pub(crate) mod util;
pub mod vm;

pub use vm::{Config, JStarResult, VirtualMachine};
