//! Snapshot supervisor: one scheduling loop per declared volume, driven by
//! the volume and policy records in the config store.

pub mod scheduler;
pub mod supervisor;

pub use scheduler::{LoopState, StateTable};
pub use supervisor::Supervisor;
