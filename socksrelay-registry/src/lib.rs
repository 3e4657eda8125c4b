pub mod admission;
pub mod registry;

pub use admission::{channel, AdmissionSender};
pub use registry::{AdmissionEvent, CheckedOutEntry, IsAdmin, RelaySnapshotRow, Registry};
