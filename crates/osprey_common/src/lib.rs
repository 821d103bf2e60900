//! Shared kernel for the osprey token-ring metadata engine.
//!
//! Everything here is deliberately small and dependency-light: the newtype
//! ids every other crate speaks in, the error taxonomy, and the
//! cooperative-yield utilities that keep large-container work from stalling
//! a core.

pub mod error;
pub mod stall;
pub mod types;

pub use error::{on_internal_error, RingError, RingResult};
pub use stall::{clear_gently, Yielder, YIELD_BATCH};
pub use types::{DcRack, Endpoint, HostId, RingVersion, Token};
