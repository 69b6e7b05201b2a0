//! Tether Protocol
//!
//! Shared types exchanged between the Tether server, backend CLI processes,
//! and browser clients. Backend traffic stays opaque (`Envelope` peeks at
//! discriminators without owning the full grammar); browser traffic is a
//! closed, typed alphabet.

mod browser;
mod envelope;
mod types;

pub use browser::*;
pub use envelope::*;
pub use types::*;
