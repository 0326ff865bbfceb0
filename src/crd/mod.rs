//! Custom Resource Definitions
//!
//! - [`dynakube`] - the DynaKube CR configuring the Dynatrace agent set
//! - [`edgeconnect`] - the EdgeConnect CR (core only reads it for diagnostics)

pub mod dynakube;
pub mod edgeconnect;

pub use dynakube::{Capability, DynaKube, DynaKubeSpec, DynaKubeStatus};
pub use edgeconnect::{EdgeConnect, EdgeConnectSpec};
