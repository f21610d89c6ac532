//! Sync engine: orchestrates the backup / pull / reconcile cycle.

use crate::context::{Session, VaulticContext};
use crate::crypto::{seal_key_for, KeyScope};
use crate::entity::UserVault;
use crate::sync::change_tracker::{acknowledge, build_backup};
use crate::sync::config::owner_versions;
use crate::sync::models::{
    BackupRequest, BackupResponse, EntityPayload, PullRequest, SyncReport, UserDataPayload,
};
use crate::sync::reconcile::reconcile;
use crate::sync::server::BackupServer;
use crate::{Result, VaulticError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Drives one user's data to and from a [`BackupServer`].
///
/// Only one sync runs per context at a time; a second call fails with
/// [`VaulticError::SyncInProgress`] instead of queueing.
pub struct SyncEngine {
    ctx: Arc<VaulticContext>,
    server: Arc<dyn BackupServer + Send + Sync>,
    user_id: i64,
}

impl SyncEngine {
    pub fn new(
        ctx: Arc<VaulticContext>,
        server: Arc<dyn BackupServer + Send + Sync>,
        user_id: i64,
    ) -> Self {
        Self {
            ctx,
            server,
            user_id,
        }
    }

    /// Engine for the signed-in user of `session`.
    pub fn for_session(session: &Session, server: Arc<dyn BackupServer + Send + Sync>) -> Self {
        Self::new(Arc::clone(session.context()), server, session.user_id())
    }

    fn guard(&self) -> Result<OwnedMutexGuard<()>> {
        Arc::clone(self.ctx.sync_guard())
            .try_lock_owned()
            .map_err(|_| VaulticError::SyncInProgress)
    }

    /// Await a server call under the configured request timeout.
    async fn call<T>(&self, what: &str, request: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.ctx.settings().sync.request_timeout();
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                warn!(what, ?timeout, "backup server did not answer in time");
                Err(VaulticError::Timeout(what.to_string()))
            }
        }
    }

    /// Send pending local changes, reconciling and re-sending on conflict.
    #[tracing::instrument(skip_all, fields(user_id = self.user_id))]
    pub async fn backup(&self) -> Result<SyncReport> {
        let _guard = self.guard()?;
        let mut report = SyncReport::default();
        self.backup_locked(&mut report).await?;
        Ok(report)
    }

    /// Fetch the server's copy and reconcile it, re-sending local data if needed.
    #[tracing::instrument(skip_all, fields(user_id = self.user_id))]
    pub async fn pull(&self) -> Result<SyncReport> {
        let _guard = self.guard()?;
        let mut report = SyncReport::default();
        if self.pull_locked(&mut report).await? {
            self.backup_locked(&mut report).await?;
        }
        Ok(report)
    }

    /// Pull, then back up whatever is still pending.
    #[tracing::instrument(skip_all, fields(user_id = self.user_id))]
    pub async fn sync(&self) -> Result<SyncReport> {
        let _guard = self.guard()?;
        let mut report = SyncReport::default();
        self.pull_locked(&mut report).await?;
        self.backup_locked(&mut report).await?;
        info!(
            acknowledged = report.acknowledged,
            repush_rounds = report.repush_rounds,
            reconciled = report.reconciled,
            "sync complete"
        );
        Ok(report)
    }

    async fn backup_locked(&self, report: &mut SyncReport) -> Result<()> {
        let max_rounds = self.ctx.settings().sync.max_repush_rounds;
        loop {
            let pending = self
                .ctx
                .with_db(|db| build_backup(db.conn(), self.user_id))?;
            if pending.is_empty() {
                debug!("nothing to back up");
                return Ok(());
            }

            let request = BackupRequest {
                user_id: self.user_id,
                user_data_payload: pending.payload,
            };
            match self.call("backup", self.server.backup(request)).await? {
                BackupResponse::Accepted { change_versions } => {
                    report.acknowledged +=
                        acknowledge(&self.ctx, &pending.manifest, &change_versions)?;
                    return Ok(());
                }
                BackupResponse::Conflict { server } => {
                    if report.repush_rounds >= max_rounds {
                        warn!(rounds = report.repush_rounds, "server keeps rejecting backup");
                        return Err(VaulticError::RePushLimitExceeded {
                            rounds: report.repush_rounds,
                        });
                    }
                    report.repush_rounds += 1;
                    debug!(round = report.repush_rounds, "backup conflicted; reconciling");
                    let outcome = reconcile(&self.ctx, self.user_id, &server)?;
                    report.reconciled += outcome.applied;
                    report.needs_refetch += outcome.needs_refetch;
                }
            }
        }
    }

    /// Returns whether reconciliation left data the server must receive.
    async fn pull_locked(&self, report: &mut SyncReport) -> Result<bool> {
        let limit = self.ctx.settings().sync.pull_page_limit;
        let mut needs_repush = false;
        loop {
            let change_versions = self.ctx.with_db(|db| owner_versions(db.conn()))?;
            let request = PullRequest {
                user_id: self.user_id,
                change_versions,
                limit: Some(limit),
            };
            let payload = self.call("pull", self.server.pull(request)).await?;
            let outcome = reconcile(&self.ctx, self.user_id, &payload)?;
            report.reconciled += outcome.applied;
            report.needs_refetch += outcome.needs_refetch;
            needs_repush |= outcome.needs_repush;

            // a full page means the server may hold more change entries
            let full_page = payload
                .all_changes()
                .any(|group| group.all_changes.len() >= limit as usize);
            if !full_page || outcome.needs_refetch > 0 {
                return Ok(needs_repush);
            }
        }
    }

    /// Share a vault with another user by sealing its key to their public key.
    ///
    /// The recipient takes the membership over on their next pull.
    #[tracing::instrument(skip(self, recipient_public_key))]
    pub async fn share_vault(
        &self,
        vault_id: i64,
        recipient_user_id: i64,
        recipient_public_key: &str,
        permissions: i64,
    ) -> Result<UserVault> {
        let _guard = self.guard()?;
        let vault_key = self.ctx.key_for(KeyScope::Vault(vault_id))?;

        let mut link = UserVault::new(recipient_user_id, vault_id, false);
        link.permissions = permissions;
        link.is_setup = false;
        link.vault_key = seal_key_for(recipient_public_key, &vault_key)?;

        let request = BackupRequest {
            user_id: self.user_id,
            user_data_payload: UserDataPayload {
                shared_user_vaults: Some(vec![EntityPayload::from_entity(&link, true)]),
                ..Default::default()
            },
        };
        match self.call("share", self.server.backup(request)).await? {
            BackupResponse::Accepted { .. } => {
                info!(vault_id, recipient_user_id, "vault shared");
                Ok(link)
            }
            BackupResponse::Conflict { .. } => Err(VaulticError::Server(format!(
                "share of vault {} was rejected",
                vault_id
            ))),
        }
    }
}
