//! Model zoo: hub access, snapshot selection and local artifacts.

pub mod acquire;
pub mod artifact;
pub mod download;
pub mod snapshot;

pub use acquire::{AcquisitionReport, acquire, persist};
pub use artifact::{disk_usage, group_digits, to_gb};
pub use download::{HubClient, ModelSource};
pub use snapshot::{ModelSnapshot, RepoFiles};
