//! Commit stores: where an approved decision lands
//!
//! The engine funnels every successful run through exactly one commit
//! call, guarded by the run's idempotency marker. Swapping the store
//! is how deployments wire the orchestrator to their TMS or dispatch
//! backend without touching the engine.

use async_trait::async_trait;

use crate::agents::Candidate;
use crate::db::Run;

/// Applies the approved decision as the business side effect
#[async_trait]
pub trait CommitStore: Send + Sync {
    async fn commit(&self, run: &Run, candidate: &Candidate) -> anyhow::Result<()>;
}

/// Commit store that records decisions to the log only
///
/// The default when no backend is wired up; useful for demos and for
/// running the orchestrator against a read-only data source.
pub struct LoggingCommitStore;

#[async_trait]
impl CommitStore for LoggingCommitStore {
    async fn commit(&self, run: &Run, candidate: &Candidate) -> anyhow::Result<()> {
        tracing::info!(
            run_id = %run.id,
            workflow = %run.workflow,
            candidate = %candidate.id,
            "Committing approved decision"
        );
        Ok(())
    }
}
