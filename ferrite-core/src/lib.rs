//! User-space instruction-set simulator for RV32IMAC in machine mode.
//!
//! The crate is built around [`engine::Engine`], which owns the complete
//! architectural state of a single hart (registers, CSRs, the LR/SC
//! reservation, the machine timer) together with the system bus it fetches
//! from and executes against. A host embeds the engine by loading an image
//! into RAM, optionally mapping peripherals onto the bus and installing a
//! [`engine::HostBridge`], and then driving [`engine::Engine::step`] or
//! [`engine::Engine::run`].
//!
//! Supported architecture: RV32I base, M (multiply/divide), A (word-width
//! atomics), and C (compressed) extensions, machine privilege level only.

#[macro_use]
extern crate static_assertions;

pub mod bus;
pub mod engine;
pub mod instruction;
pub mod registers;
pub mod resources;

pub use bus::SystemBus;
pub use engine::Engine;
