//! Capability (handle) space, memory subsystem, and stream/lane IPC engine
//! of a microkernel.
//!
//! Built `no_std` against `alloc`; the `cfg(test)` build links `std` the
//! same way the hosted half of the originating kernel does, so unit tests
//! can run on a normal host target instead of only under an emulator.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod collaborators;
pub mod cpu_set;
pub mod error;
pub mod event;
pub mod futex;
pub mod handle;
pub mod irq;
pub mod log;
pub mod memory;
pub mod queue;
pub mod stream;
pub mod sync;
pub mod thread;
pub mod virt;

pub use error::{HelError, HelResult};
pub use handle::{Descriptor, Handle, Universe};
