//! Utility functions and types.

mod digest;
mod oci;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use digest::*;
pub use oci::*;
