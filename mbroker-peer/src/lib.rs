//! Synchronisation of local project permissions to a remote peer instance.

pub mod client;
pub mod sync;

pub use client::{HttpPeerClient, NewPeerProject, PeerClient, PeerError, PeerPermission, PeerProject};
pub use sync::{PermissionSynchronizer, SyncError, SyncReport};
