//! laplus kernel-userland network ABI types.
//!
//! This crate is the single source of truth for every structure and constant
//! that crosses the socket boundary: address families, socket types, the
//! `sockaddr` family of structures, `ifreq`, the `SIOC*` request codes and the
//! errno values handed back to callers.  Layouts follow Linux bit-for-bit so
//! that external tooling (`ifconfig` and friends) can drive the stack unchanged.
//!
//! All shared structures are `#[repr(C)]` for ABI stability.

#![no_std]
#![forbid(unsafe_code)]

pub mod errno;
pub mod net;

pub use errno::*;
pub use net::*;
