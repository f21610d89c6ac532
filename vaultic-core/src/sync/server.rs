//! The backup server as seen from the client.

use crate::sync::models::{BackupRequest, BackupResponse, PullRequest, UserDataPayload};
use crate::Result;

/// A peer that stores encrypted backups and arbitrates between devices.
///
/// Implementations own the transport. Calls are wrapped in the sync
/// engine's timeout, so they need no deadline of their own.
#[async_trait::async_trait]
pub trait BackupServer {
    /// Upload pending changes. A conflict returns the server's current copy.
    async fn backup(&self, request: BackupRequest) -> Result<BackupResponse>;

    /// Fetch the server's copy, with change entries newer than the versions given.
    async fn pull(&self, request: PullRequest) -> Result<UserDataPayload>;
}
