//! The RAR v3 filter virtual machine: instruction set, program compiler,
//! executor, and the native fast paths for its four well-known fingerprinted
//! filters (delta, x86 call/jump, RGB delta, audio).
//!
//! Grounded on `ext/unarr/rar/rarvm.{h,c}` and `filter-rar.c`.

pub mod audio;
pub mod filters;
pub mod opcodes;
pub mod program;

pub use filters::{FilterQueue, FilteredBytes};
pub use program::{Program, VirtualMachine, DEFAULT_INSTRUCTION_BUDGET};
