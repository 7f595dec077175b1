//! Idempotent reconciliation of host resources
//!
//! Each primitive checks the current state before mutating it, so running
//! the whole setup again on a provisioned node converges to the same state.

pub mod fstab;
pub mod mount;
pub mod ownership;
pub mod symlink;

pub use fstab::{FstabEntry, MountKind, ensure_fstab_entry};
pub use mount::{reconcile_bind_mount, reconcile_disk_mount, reconcile_network_mount};
pub use ownership::{HostFs, Owner, OwnershipChange, OwnershipFs, SimulatedFs, remap_ownership};
pub use symlink::ensure_symlink;
