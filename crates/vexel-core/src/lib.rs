pub mod capability;
pub mod config;
pub mod error;
pub mod family;
pub mod slab;

pub use capability::CapabilitySet;
pub use config::VexelConfig;
pub use error::{ExecError, ExecResult};
pub use family::QueueFamily;
pub use slab::{Slab, SlotState};
