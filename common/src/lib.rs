//! Records shared by the volplugin daemon, the snapshot supervisor and volcli.
//!
//! Every type here is stored as a JSON document in the config store; relations
//! between them (volume → policy, mount → volume) are plain string keys.

pub mod global;
pub mod mount;
pub mod naming;
pub mod policy;
pub mod schedule;
pub mod volume;

pub use global::GlobalConfig;
pub use mount::MountState;
pub use naming::{NameError, VolumeName, validate_policy_name, validate_volume_name};
pub use policy::{DriverOptions, Intent, Policy, PolicyError, SnapshotPolicy};
pub use schedule::{SchedulerState, after, snapshot_name};
pub use volume::Volume;
