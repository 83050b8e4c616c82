//! # Job Queue
//!
//! Leased work queue of pending pipe runs stored in `queued_pipes`.
//!
//! Two partial unique indexes carry the queue's guarantees:
//! `idx_queued_pipes_pending` allows one unclaimed entry per pipe, and
//! `idx_queued_pipes_in_flight` allows one claimed, unfinished entry per workspace.
//! A claim is a conditional update on `claimed_at IS NULL`, so concurrent claimants
//! in other processes can never take the same entry, and a claim that would give a
//! workspace a second in-flight run fails on the index and is skipped.
//!
//! Claims are leases: an entry claimed longer ago than the lease is treated as
//! abandoned by a dead worker and finished by whoever claims or enqueues next.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use metrics::{counter, gauge};
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, is_unique_violation};
use crate::models::queued_pipe::{self, Entity as QueuedPipeEntity};
use crate::repositories::PipeRepository;
use crate::types::{PipeId, WorkspaceId};

/// Priority of entries created by the automatic sweep.
pub const PRIORITY_AUTOMATIC: i16 = 0;
/// Priority of entries boosted by a manual run request.
pub const PRIORITY_MANUAL: i16 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue entry {entry_id} is not claimed by {worker}")]
    NotClaimed { entry_id: Uuid, worker: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DbErr> for QueueError {
    fn from(err: DbErr) -> Self {
        QueueError::Store(StoreError::Database(err))
    }
}

impl QueueError {
    /// True when the database rejected a write on one of the queue's unique indexes.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, QueueError::Store(StoreError::Database(err)) if is_unique_violation(err))
    }
}

/// A claimed queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: Uuid,
    pub workspace_id: WorkspaceId,
    pub pipe: PipeId,
    pub priority: i16,
    pub claimed_by: String,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    db: DatabaseConnection,
    pipes: PipeRepository,
    claim_batch_size: usize,
    lease: Duration,
}

impl JobQueue {
    pub fn new(db: DatabaseConnection, claim_batch_size: usize, lease_seconds: u64) -> Self {
        let lease_seconds = i64::try_from(lease_seconds.max(1)).unwrap_or(i64::MAX);
        Self {
            pipes: PipeRepository::new(db.clone()),
            db,
            claim_batch_size: claim_batch_size.max(1),
            lease: Duration::try_seconds(lease_seconds).unwrap_or(Duration::MAX),
        }
    }

    /// Finishes in-flight entries whose lease ran out, freeing their workspaces.
    ///
    /// The worker that held such a claim may still call [`JobQueue::mark_complete`]
    /// until the next automatic enqueue purges the entry; after that it gets
    /// [`QueueError::NotClaimed`].
    pub async fn expire_stale_claims(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = now.checked_sub_signed(self.lease).unwrap_or(now);
        let expired = QueuedPipeEntity::update_many()
            .col_expr(
                queued_pipe::Column::CompletedAt,
                Expr::value(now.fixed_offset()),
            )
            .filter(queued_pipe::Column::ClaimedAt.lt(cutoff.fixed_offset()))
            .filter(queued_pipe::Column::CompletedAt.is_null())
            .exec(&self.db)
            .await?
            .rows_affected;

        if expired > 0 {
            counter!("pipes_queue_expired_claims_total").increment(expired);
            warn!(expired, "Finished queue entries whose claim lease ran out");
        }
        Ok(expired)
    }

    /// Queues every automatic pipe that has no unclaimed or in-flight entry.
    ///
    /// Expired claims are finished and finished entries purged first. Returns the
    /// number of new entries.
    pub async fn enqueue_automatic(&self) -> Result<u64, QueueError> {
        self.expire_stale_claims().await?;
        let pipes = self.pipes.list_automatic().await?;
        let txn = self.db.begin().await?;

        let purged = QueuedPipeEntity::delete_many()
            .filter(queued_pipe::Column::CompletedAt.is_not_null())
            .exec(&txn)
            .await?
            .rows_affected;

        let open: HashSet<(WorkspaceId, String)> = QueuedPipeEntity::find()
            .select_only()
            .column(queued_pipe::Column::WorkspaceId)
            .column(queued_pipe::Column::PipeKey)
            .filter(queued_pipe::Column::CompletedAt.is_null())
            .into_tuple::<(WorkspaceId, String)>()
            .all(&txn)
            .await?
            .into_iter()
            .collect();

        let now = Utc::now().fixed_offset();
        let mut inserted = 0;
        for pipe in pipes {
            let key = pipe.id.key();
            if open.contains(&(pipe.workspace_id, key.clone())) {
                continue;
            }
            let row = queued_pipe::ActiveModel {
                id: Set(Uuid::new_v4()),
                workspace_id: Set(pipe.workspace_id),
                pipe_key: Set(key),
                priority: Set(PRIORITY_AUTOMATIC),
                created_at: Set(now),
                claimed_at: Set(None),
                claimed_by: Set(None),
                completed_at: Set(None),
            };
            // A concurrent enqueuer may have inserted the same pending entry.
            let result = QueuedPipeEntity::insert(row)
                .on_conflict(OnConflict::new().do_nothing().to_owned())
                .exec_without_returning(&txn)
                .await?;
            inserted += result;
        }

        txn.commit().await?;

        counter!("pipes_queue_enqueued_total", "source" => "automatic").increment(inserted);
        info!(inserted, purged, "Enqueued automatic pipes");
        Ok(inserted)
    }

    /// Queues the pipe at manual priority, or promotes its pending entry.
    pub async fn boost_and_enqueue(
        &self,
        workspace_id: WorkspaceId,
        pipe: &PipeId,
    ) -> Result<(), QueueError> {
        let key = pipe.key();
        let row = queued_pipe::ActiveModel {
            id: Set(Uuid::new_v4()),
            workspace_id: Set(workspace_id),
            pipe_key: Set(key.clone()),
            priority: Set(PRIORITY_MANUAL),
            created_at: Set(Utc::now().fixed_offset()),
            claimed_at: Set(None),
            claimed_by: Set(None),
            completed_at: Set(None),
        };
        QueuedPipeEntity::insert(row)
            .on_conflict(OnConflict::new().do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;

        QueuedPipeEntity::update_many()
            .col_expr(queued_pipe::Column::Priority, Expr::value(PRIORITY_MANUAL))
            .filter(queued_pipe::Column::WorkspaceId.eq(workspace_id))
            .filter(queued_pipe::Column::PipeKey.eq(key))
            .filter(queued_pipe::Column::ClaimedAt.is_null())
            .exec(&self.db)
            .await?;

        counter!("pipes_queue_enqueued_total", "source" => "manual").increment(1);
        debug!(workspace_id, pipe = %pipe, "Boosted pipe in queue");
        Ok(())
    }

    /// Records a run started outside the sweep as the workspace's in-flight entry.
    ///
    /// Returns `None` when the workspace already has a run in flight, here or in
    /// another process.
    pub async fn claim_direct(
        &self,
        workspace_id: WorkspaceId,
        pipe: &PipeId,
        worker: &str,
    ) -> Result<Option<QueueEntry>, QueueError> {
        self.expire_stale_claims().await?;

        let now = Utc::now().fixed_offset();
        let id = Uuid::new_v4();
        let row = queued_pipe::ActiveModel {
            id: Set(id),
            workspace_id: Set(workspace_id),
            pipe_key: Set(pipe.key()),
            priority: Set(PRIORITY_MANUAL),
            created_at: Set(now),
            claimed_at: Set(Some(now)),
            claimed_by: Set(Some(worker.to_string())),
            completed_at: Set(None),
        };
        match QueuedPipeEntity::insert(row)
            .exec_without_returning(&self.db)
            .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                debug!(workspace_id, pipe = %pipe, "Workspace already has a run in flight");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        counter!("pipes_queue_claimed_total").increment(1);
        Ok(Some(QueueEntry {
            id,
            workspace_id,
            pipe: pipe.clone(),
            priority: PRIORITY_MANUAL,
            claimed_by: worker.to_string(),
        }))
    }

    /// Claims at most one pending entry per workspace, highest priority then oldest first.
    ///
    /// Workspaces with a run already in flight are skipped.
    pub async fn claim_batch(&self, worker: &str) -> Result<Vec<QueueEntry>, QueueError> {
        self.expire_stale_claims().await?;

        let in_flight = Query::select()
            .column(queued_pipe::Column::WorkspaceId)
            .from(QueuedPipeEntity)
            .and_where(Expr::col(queued_pipe::Column::ClaimedAt).is_not_null())
            .and_where(Expr::col(queued_pipe::Column::CompletedAt).is_null())
            .to_owned();

        let candidates = QueuedPipeEntity::find()
            .filter(queued_pipe::Column::ClaimedAt.is_null())
            .filter(queued_pipe::Column::WorkspaceId.not_in_subquery(in_flight))
            .order_by_desc(queued_pipe::Column::Priority)
            .order_by_asc(queued_pipe::Column::CreatedAt)
            .all(&self.db)
            .await?;

        let mut seen = HashSet::new();
        let candidates: Vec<queued_pipe::Model> = candidates
            .into_iter()
            .filter(|row| seen.insert(row.workspace_id))
            .take(self.claim_batch_size)
            .collect();
        gauge!("pipes_queue_claimable_workspaces").set(seen.len() as f64);

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let now = Utc::now().fixed_offset();
            let result = QueuedPipeEntity::update_many()
                .col_expr(queued_pipe::Column::ClaimedAt, Expr::value(now))
                .col_expr(queued_pipe::Column::ClaimedBy, Expr::value(worker))
                .filter(queued_pipe::Column::Id.eq(row.id))
                .filter(queued_pipe::Column::ClaimedAt.is_null())
                .exec(&self.db)
                .await;

            match result {
                Ok(res) if res.rows_affected == 1 => {}
                Ok(_) => continue,
                Err(err) if is_unique_violation(&err) => {
                    debug!(workspace_id = row.workspace_id, "Workspace claimed concurrently, skipping");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            let pipe = match PipeId::parse(&row.pipe_key) {
                Ok(pipe) => pipe,
                Err(err) => {
                    // Finish it so the workspace is not blocked by an unrunnable entry.
                    warn!(entry_id = %row.id, error = %err, "Dropping malformed queue entry");
                    self.mark_complete(row.id, worker).await?;
                    continue;
                }
            };

            claimed.push(QueueEntry {
                id: row.id,
                workspace_id: row.workspace_id,
                pipe,
                priority: row.priority,
                claimed_by: worker.to_string(),
            });
        }

        if !claimed.is_empty() {
            counter!("pipes_queue_claimed_total").increment(claimed.len() as u64);
            debug!(worker, claimed = claimed.len(), "Claimed queue entries");
        }
        Ok(claimed)
    }

    /// Finishes an entry claimed by `worker`. Completing a finished entry is a no-op.
    pub async fn mark_complete(&self, entry_id: Uuid, worker: &str) -> Result<(), QueueError> {
        let result = QueuedPipeEntity::update_many()
            .col_expr(
                queued_pipe::Column::CompletedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(queued_pipe::Column::Id.eq(entry_id))
            .filter(queued_pipe::Column::ClaimedBy.eq(worker))
            .filter(queued_pipe::Column::CompletedAt.is_null())
            .exec(&self.db)
            .await?;
        if result.rows_affected == 1 {
            return Ok(());
        }

        let row = QueuedPipeEntity::find_by_id(entry_id).one(&self.db).await?;
        match row {
            Some(row) if row.completed_at.is_some() && row.claimed_by.as_deref() == Some(worker) => {
                Ok(())
            }
            _ => Err(QueueError::NotClaimed {
                entry_id,
                worker: worker.to_string(),
            }),
        }
    }

    /// Number of unclaimed entries.
    pub async fn pending_count(&self) -> Result<u64, QueueError> {
        Ok(QueuedPipeEntity::find()
            .filter(queued_pipe::Column::ClaimedAt.is_null())
            .count(&self.db)
            .await?)
    }
}
