//! Workflow engine: the propose → audit → gate state machine
//!
//! The engine owns every run mutation. Each transition is durably
//! recorded before its event is published, so an observer reading run
//! state always sees a phase consistent with the latest recorded step.
//! Rejections and infrastructure failures are resolved here and never
//! surface as errors to callers; the externally visible signals are
//! the run's phase, outcome, and reason fields.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::agents::{call_with_retry, AgentContext, AgentRole, AgentSet, Candidate, Proposal};
use crate::db::{Database, Run, RunOutcome, RunPhase, StepOutcome, StoreError};
use crate::events::{EventDraft, EventKind, Severity};
use crate::gate::{decide, GateOutcome};
use crate::stream::GlassDoor;

use super::commit::CommitStore;
use super::workflow::WorkflowSpec;

/// Terminal reason when every candidate was rejected or the proposer
/// had nothing to offer
pub const REASON_NO_CANDIDATE: &str = "no eligible candidate";
/// Terminal reason when the gate kept rejecting until the attempt
/// budget ran out
pub const REASON_THRESHOLD: &str = "threshold not met after retries";
/// Terminal reason when an agent call kept failing at the
/// infrastructure level; deliberately distinct from the business "no"
pub const REASON_UNAVAILABLE: &str = "agent unavailable";
/// Terminal reason when a reviewer declined an escalated run
pub const REASON_REVIEWER_REJECTED: &str = "rejected by reviewer";
/// Terminal reason for an explicit cancellation
pub const REASON_CANCELLED: &str = "cancelled by request";
/// Terminal reason when the business side effect could not be applied
pub const REASON_COMMIT_FAILED: &str = "terminal write failed";
/// Terminal reason for an orphaned run whose workflow no longer exists
pub const REASON_WORKFLOW_REMOVED: &str = "workflow definition missing";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run {0} has no candidate under consideration")]
    MissingCandidate(String),

    #[error("run {0} is not awaiting review")]
    NotSuspended(String),

    #[error("run {0} was cancelled")]
    Cancelled(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
}

/// What one phase handler decided the loop should do next
enum Flow {
    Continue,
    Done(Run),
}

/// The orchestrator engine
///
/// Cheap to clone; one `execute` call drives one run on its own task.
#[derive(Clone)]
pub struct Engine {
    db: Database,
    door: GlassDoor,
    commit: Arc<dyn CommitStore>,
}

impl Engine {
    pub fn new(db: Database, door: GlassDoor, commit: Arc<dyn CommitStore>) -> Self {
        Self { db, door, commit }
    }

    /// Drive a run from its current phase until it is terminal or
    /// durably suspended for review
    pub async fn execute(
        &self,
        spec: &WorkflowSpec,
        agents: &AgentSet,
        mut run: Run,
    ) -> Result<Run, EngineError> {
        tracing::info!(run_id = %run.id, workflow = %run.workflow, "Executing run");

        loop {
            if run.cancel_requested {
                return self.finish_cancelled(run);
            }

            let flow = match run.phase {
                RunPhase::Running => self.propose(spec, agents, &mut run).await?,
                RunPhase::Auditing => self.audit(spec, agents, &mut run).await?,
                RunPhase::Gating => self.gate(spec, agents, &mut run).await?,
                RunPhase::Retrying => {
                    run.candidate = None;
                    run.phase = RunPhase::Running;
                    self.persist(&mut run)?;
                    Flow::Continue
                }
                // Terminal or suspended runs have nothing left to do
                _ => return Ok(run),
            };

            match flow {
                Flow::Continue => {}
                Flow::Done(run) => return Ok(run),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Phase handlers
    // ------------------------------------------------------------------------

    async fn propose(
        &self,
        spec: &WorkflowSpec,
        agents: &AgentSet,
        run: &mut Run,
    ) -> Result<Flow, EngineError> {
        let ctx = self.context(run);

        // The step row lands before the event that announces it
        let seq = self
            .db
            .begin_step(&run.id, AgentRole::Proposer, &summarize(&run.input))?;
        self.door.publish(
            &run.id,
            EventDraft::thinking(AgentRole::Proposer, "Looking for a candidate"),
        )?;
        let started = Instant::now();

        let policy = spec.call_policy();
        let result = call_with_retry(AgentRole::Proposer, &policy, || {
            agents.proposer.propose(&ctx)
        })
        .await;
        let elapsed = started.elapsed().as_millis() as i64;
        self.refresh_cancel(run)?;

        let proposal = match result {
            Ok(proposal) => proposal,
            Err(e) => {
                self.db.finish_step(
                    &run.id,
                    seq,
                    StepOutcome::Error,
                    &e.to_string(),
                    None,
                    elapsed,
                    None,
                )?;
                return self.fail(run, REASON_UNAVAILABLE, &e.to_string()).map(Flow::Done);
            }
        };

        // A cancel requested mid-call discards the result
        if run.cancel_requested {
            return self.finish_cancelled(run.clone()).map(Flow::Done);
        }

        match proposal {
            Proposal::NoCandidate { reason } => {
                self.db.finish_step(
                    &run.id,
                    seq,
                    StepOutcome::Rejected,
                    &reason,
                    None,
                    elapsed,
                    None,
                )?;
                self.fail(run, REASON_NO_CANDIDATE, &reason).map(Flow::Done)
            }
            Proposal::Candidate {
                candidate,
                reasoning,
                usage,
            } => {
                self.db.finish_step(
                    &run.id,
                    seq,
                    StepOutcome::Approved,
                    &format!("proposed {}", candidate.id),
                    Some(&reasoning),
                    elapsed,
                    usage,
                )?;

                // A proposer that re-offers a rejected candidate has
                // nothing new; failing here is what prevents an
                // infinite retry loop
                if run.excluded.contains(&candidate.id) {
                    let detail = format!("candidate {} was already rejected", candidate.id);
                    return self.fail(run, REASON_NO_CANDIDATE, &detail).map(Flow::Done);
                }

                run.candidate = Some(candidate.clone());
                run.phase = RunPhase::Auditing;
                self.persist(run)?;
                self.door.publish(
                    &run.id,
                    EventDraft::decision(
                        AgentRole::Proposer,
                        format!("Proposed candidate {}", candidate.id),
                    )
                    .with_reasoning(reasoning),
                )?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn audit(
        &self,
        spec: &WorkflowSpec,
        agents: &AgentSet,
        run: &mut Run,
    ) -> Result<Flow, EngineError> {
        let candidate = run
            .candidate
            .clone()
            .ok_or_else(|| EngineError::MissingCandidate(run.id.clone()))?;
        let ctx = self.context(run);

        let seq = self
            .db
            .begin_step(&run.id, AgentRole::Auditor, &format!("audit {}", candidate.id))?;
        self.door.publish(
            &run.id,
            EventDraft::thinking(
                AgentRole::Auditor,
                format!("Auditing candidate {}", candidate.id),
            ),
        )?;
        let started = Instant::now();

        let policy = spec.call_policy();
        let result = call_with_retry(AgentRole::Auditor, &policy, || {
            agents.auditor.audit(&ctx, &candidate)
        })
        .await;
        let elapsed = started.elapsed().as_millis() as i64;
        self.refresh_cancel(run)?;

        let verdict = match result {
            Ok(verdict) => verdict,
            Err(e) => {
                self.db.finish_step(
                    &run.id,
                    seq,
                    StepOutcome::Error,
                    &e.to_string(),
                    None,
                    elapsed,
                    None,
                )?;
                return self.fail(run, REASON_UNAVAILABLE, &e.to_string()).map(Flow::Done);
            }
        };

        if run.cancel_requested {
            return self.finish_cancelled(run.clone()).map(Flow::Done);
        }

        if verdict.accepted {
            self.db.finish_step(
                &run.id,
                seq,
                StepOutcome::Approved,
                "accepted",
                Some(&verdict.reasoning),
                elapsed,
                verdict.usage,
            )?;
            run.phase = RunPhase::Gating;
            self.persist(run)?;
            self.door.publish(
                &run.id,
                EventDraft::decision(
                    AgentRole::Auditor,
                    format!("Audit accepted candidate {}", candidate.id),
                )
                .with_reasoning(verdict.reasoning),
            )?;
            Ok(Flow::Continue)
        } else {
            let reasons = verdict.reasons.join("; ");
            self.db.finish_step(
                &run.id,
                seq,
                StepOutcome::Rejected,
                &reasons,
                Some(&verdict.reasoning),
                elapsed,
                verdict.usage,
            )?;
            self.reject_candidate(
                spec,
                run,
                &candidate,
                AgentRole::Auditor,
                &reasons,
                REASON_NO_CANDIDATE,
            )
        }
    }

    async fn gate(
        &self,
        spec: &WorkflowSpec,
        agents: &AgentSet,
        run: &mut Run,
    ) -> Result<Flow, EngineError> {
        let candidate = run
            .candidate
            .clone()
            .ok_or_else(|| EngineError::MissingCandidate(run.id.clone()))?;
        let ctx = self.context(run);

        let seq = self
            .db
            .begin_step(&run.id, AgentRole::Gatekeeper, &format!("score {}", candidate.id))?;
        let started = Instant::now();

        let policy = spec.call_policy();
        let result = call_with_retry(AgentRole::Gatekeeper, &policy, || {
            agents.gatekeeper.score(&ctx, &candidate)
        })
        .await;
        let elapsed = started.elapsed().as_millis() as i64;
        self.refresh_cancel(run)?;

        let score = match result {
            Ok(score) => score,
            Err(e) => {
                self.db.finish_step(
                    &run.id,
                    seq,
                    StepOutcome::Error,
                    &e.to_string(),
                    None,
                    elapsed,
                    None,
                )?;
                return self.fail(run, REASON_UNAVAILABLE, &e.to_string()).map(Flow::Done);
            }
        };

        if run.cancel_requested {
            return self.finish_cancelled(run.clone()).map(Flow::Done);
        }

        let outcome = decide(score.value, &spec.gate);
        tracing::debug!(run_id = %run.id, metric = score.value, %outcome, "Gate decided");

        match outcome {
            GateOutcome::Approve => {
                self.db.finish_step(
                    &run.id,
                    seq,
                    StepOutcome::Approved,
                    &format!("approved at {:.2}", score.value),
                    Some(&score.reasoning),
                    elapsed,
                    score.usage,
                )?;
                self.succeed(spec, run, &candidate).await.map(Flow::Done)
            }
            GateOutcome::RejectRetry => {
                let detail = format!("metric {:.2} below threshold", score.value);
                self.db.finish_step(
                    &run.id,
                    seq,
                    StepOutcome::Rejected,
                    &detail,
                    Some(&score.reasoning),
                    elapsed,
                    score.usage,
                )?;
                self.reject_candidate(
                    spec,
                    run,
                    &candidate,
                    AgentRole::Gatekeeper,
                    &detail,
                    REASON_THRESHOLD,
                )
            }
            GateOutcome::Escalate => {
                self.db.finish_step(
                    &run.id,
                    seq,
                    StepOutcome::Approved,
                    &format!("escalated at {:.2}", score.value),
                    Some(&score.reasoning),
                    elapsed,
                    score.usage,
                )?;
                self.escalate(spec, run, &candidate, score.value).map(Flow::Done)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Exclude a rejected candidate and either loop for another
    /// attempt or exhaust the budget
    fn reject_candidate(
        &self,
        spec: &WorkflowSpec,
        run: &mut Run,
        candidate: &Candidate,
        role: AgentRole,
        detail: &str,
        exhausted_reason: &str,
    ) -> Result<Flow, EngineError> {
        run.excluded.push(candidate.id.clone());
        run.attempt += 1;

        if run.attempt >= run.max_attempts {
            return self.fail(run, exhausted_reason, detail).map(Flow::Done);
        }

        run.phase = RunPhase::Retrying;
        self.persist(run)?;
        self.door.publish(
            &run.id,
            EventDraft::rejection(
                role,
                format!(
                    "Candidate {} rejected ({}), trying another (attempt {} of {})",
                    candidate.id, detail, run.attempt, spec.max_attempts
                ),
            ),
        )?;
        Ok(Flow::Continue)
    }

    /// Terminal success: claim the idempotency marker, apply the
    /// business side effect once, finalize the run
    ///
    /// The marker claim is atomic with the cancel and terminal checks
    /// in the store: a cancel that lands first wins here, and a cancel
    /// that lands after the claim is refused by `request_cancel`. A
    /// failed commit releases the marker and finalizes the run failed,
    /// so a marker on a succeeded run always means the write happened.
    async fn succeed(
        &self,
        spec: &WorkflowSpec,
        run: &mut Run,
        candidate: &Candidate,
    ) -> Result<Run, EngineError> {
        if self.db.try_mark_committed(&run.id, &spec.commit_kind)? {
            if let Err(e) = self.commit.commit(run, candidate).await {
                tracing::error!(run_id = %run.id, error = %e, "Commit store failed");
                self.db.clear_commit_marker(&run.id)?;
                return self.fail(run, REASON_COMMIT_FAILED, &e.to_string());
            }
        } else if self.db.is_committed(&run.id)? {
            // A replayed transition finds the marker and skips the write
            tracing::warn!(run_id = %run.id, "Commit marker already claimed, skipping");
        } else {
            // The claim was refused: a cancel won the race
            let fresh = self
                .db
                .get_run(&run.id)?
                .ok_or_else(|| StoreError::NotFound(run.id.clone()))?;
            if fresh.is_terminal() {
                return Ok(fresh);
            }
            return self.finish_cancelled(fresh);
        }

        run.phase = RunPhase::Succeeded;
        run.outcome = Some(RunOutcome::Succeeded);
        run.reason = None;
        self.persist(run)?;

        self.door.publish(
            &run.id,
            EventDraft::result(format!(
                "Run succeeded: {} committed for candidate {}",
                spec.commit_kind, candidate.id
            )),
        )?;
        self.door.retire(&run.id);
        tracing::info!(run_id = %run.id, candidate = %candidate.id, "Run succeeded");
        Ok(run.clone())
    }

    /// Park the run and open its approval request
    fn escalate(
        &self,
        spec: &WorkflowSpec,
        run: &mut Run,
        candidate: &Candidate,
        metric: f64,
    ) -> Result<Run, EngineError> {
        run.phase = RunPhase::Escalated;
        self.persist(run)?;

        let amount = candidate
            .payload
            .get("amount")
            .or_else(|| candidate.payload.get("rate"))
            .and_then(|v| v.as_f64());

        let approval = self.db.create_approval(
            &run.id,
            spec.gate.urgency,
            &format!("commit {} for candidate {}", spec.commit_kind, candidate.id),
            amount,
        )?;

        self.door.publish(
            &run.id,
            EventDraft::new(
                EventKind::Result,
                Severity::Warning,
                format!(
                    "Run escalated for review (metric {:.2}), approval request {}",
                    metric, approval.id
                ),
            ),
        )?;
        tracing::info!(run_id = %run.id, approval_id = %approval.id, "Run escalated");
        Ok(run.clone())
    }

    fn fail(&self, run: &mut Run, reason: &str, detail: &str) -> Result<Run, EngineError> {
        run.phase = RunPhase::Failed;
        run.outcome = Some(RunOutcome::Failed);
        run.reason = Some(reason.to_string());
        self.persist(run)?;

        self.door
            .publish(&run.id, EventDraft::error(format!("{}: {}", reason, detail)))?;
        self.door.publish(
            &run.id,
            EventDraft::new(
                EventKind::Result,
                Severity::Error,
                format!("Run failed: {}", reason),
            ),
        )?;
        self.door.retire(&run.id);
        tracing::warn!(run_id = %run.id, reason, "Run failed");
        Ok(run.clone())
    }

    pub(crate) fn finish_cancelled(&self, mut run: Run) -> Result<Run, EngineError> {
        run.phase = RunPhase::Cancelled;
        run.outcome = Some(RunOutcome::Cancelled);
        run.reason = Some(REASON_CANCELLED.to_string());
        self.persist(&mut run)?;

        self.door.publish(
            &run.id,
            EventDraft::new(EventKind::Result, Severity::Warning, "Run cancelled"),
        )?;
        self.door.retire(&run.id);
        tracing::info!(run_id = %run.id, "Run cancelled");
        Ok(run)
    }

    /// Resolve a pending approval request and re-enter the state
    /// machine for its run
    ///
    /// Approving performs the idempotent terminal write; rejecting
    /// finalizes the run as failed. A run cancelled while suspended is
    /// finalized as cancelled and the resolution is refused, so a late
    /// approval can never commit it.
    pub async fn resolve_approval(
        &self,
        workflows: &HashMap<String, WorkflowSpec>,
        request_id: &str,
        approve: bool,
        reviewer: &str,
    ) -> Result<Run, EngineError> {
        let approval = self
            .db
            .get_approval(request_id)?
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))?;
        let run = self
            .db
            .get_run(&approval.run_id)?
            .ok_or_else(|| StoreError::NotFound(approval.run_id.clone()))?;

        if run.cancel_requested && !run.is_terminal() {
            self.finish_cancelled(run)?;
            return Err(EngineError::Cancelled(approval.run_id));
        }
        if run.is_terminal() {
            return Err(EngineError::NotSuspended(approval.run_id));
        }
        if run.phase != RunPhase::Escalated {
            return Err(EngineError::NotSuspended(approval.run_id));
        }

        let spec = workflows
            .get(&run.workflow)
            .ok_or_else(|| EngineError::WorkflowNotFound(run.workflow.clone()))?;

        self.db.resolve_approval(request_id, approve, reviewer)?;
        tracing::info!(
            run_id = %run.id,
            approval_id = %request_id,
            approve,
            reviewer,
            "Approval resolved"
        );

        let mut run = run;
        if approve {
            let candidate = run
                .candidate
                .clone()
                .ok_or_else(|| EngineError::MissingCandidate(run.id.clone()))?;
            self.succeed(spec, &mut run, &candidate).await
        } else {
            run.phase = RunPhase::Failed;
            run.outcome = Some(RunOutcome::Failed);
            run.reason = Some(REASON_REVIEWER_REJECTED.to_string());
            self.persist(&mut run)?;
            self.door.publish(
                &run.id,
                EventDraft::new(
                    EventKind::Result,
                    Severity::Error,
                    format!("Run failed: {}", REASON_REVIEWER_REJECTED),
                ),
            )?;
            self.door.retire(&run.id);
            Ok(run)
        }
    }

    /// Re-enter runs a previous process left unfinished
    ///
    /// Called once at startup. Escalated runs stay parked for their
    /// reviewer; a run whose workflow definition no longer exists is
    /// finalized failed. Returns how many runs were picked up.
    pub async fn resume_unfinished(
        &self,
        workflows: &HashMap<String, WorkflowSpec>,
        agents: &AgentSet,
    ) -> Result<usize, EngineError> {
        let orphans = self.db.list_unfinished_runs()?;
        let count = orphans.len();

        for mut run in orphans {
            let spec = match workflows.get(&run.workflow) {
                Some(spec) => spec.clone(),
                None => {
                    let workflow = run.workflow.clone();
                    tracing::warn!(
                        run_id = %run.id,
                        workflow = %workflow,
                        "Orphaned run has no workflow definition"
                    );
                    self.fail(&mut run, REASON_WORKFLOW_REMOVED, &workflow)?;
                    continue;
                }
            };

            tracing::info!(run_id = %run.id, phase = %run.phase, "Re-entering run after restart");
            let engine = self.clone();
            let agents = agents.clone();
            tokio::spawn(async move {
                let run_id = run.id.clone();
                if let Err(e) = engine.execute(&spec, &agents, run).await {
                    tracing::error!(run_id = %run_id, error = %e, "Resumed run failed");
                }
            });
        }

        Ok(count)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn context(&self, run: &Run) -> AgentContext {
        AgentContext {
            run_id: run.id.clone(),
            tenant_id: run.tenant_id.clone(),
            input: run.input.clone(),
            excluded: run.excluded.clone(),
        }
    }

    /// Persist a run mutation, absorbing version conflicts
    ///
    /// The engine is the run's only writer apart from the cancel flag,
    /// so a conflict means a cancel arrived; reload picks it up and
    /// the retry lands on the fresh version.
    fn persist(&self, run: &mut Run) -> Result<(), EngineError> {
        loop {
            match self.db.update_run(run) {
                Ok(()) => return Ok(()),
                Err(StoreError::VersionConflict(_)) => {
                    let fresh = self
                        .db
                        .get_run(&run.id)?
                        .ok_or_else(|| StoreError::NotFound(run.id.clone()))?;
                    run.version = fresh.version;
                    run.cancel_requested = run.cancel_requested || fresh.cancel_requested;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pick up a cancel flag set while an agent call was in flight
    fn refresh_cancel(&self, run: &mut Run) -> Result<(), EngineError> {
        if let Some(fresh) = self.db.get_run(&run.id)? {
            if fresh.cancel_requested && !run.cancel_requested {
                run.cancel_requested = true;
                run.version = fresh.version;
            }
        }
        Ok(())
    }

}

/// Truncate a JSON input for step summaries
fn summarize(input: &serde_json::Value) -> String {
    let mut s = input.to_string();
    if s.len() > 200 {
        s.truncate(200);
        s.push('…');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{
        AgentError, AuditVerdict, Auditor, Gatekeeper, Proposer, Score,
    };
    use crate::db::Database;
    use crate::gate::{GatePolicy, UrgencyTier};
    use crate::orchestrator::commit::test_support::RecordingCommitStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedProposer(Mutex<VecDeque<Result<Proposal, AgentError>>>);

    #[async_trait]
    impl Proposer for ScriptedProposer {
        async fn propose(&self, _ctx: &AgentContext) -> Result<Proposal, AgentError> {
            self.0.lock().unwrap().pop_front().unwrap_or(Ok(Proposal::NoCandidate {
                reason: "script exhausted".to_string(),
            }))
        }
    }

    struct ScriptedAuditor(Mutex<VecDeque<Result<AuditVerdict, AgentError>>>);

    #[async_trait]
    impl Auditor for ScriptedAuditor {
        async fn audit(
            &self,
            _ctx: &AgentContext,
            _candidate: &Candidate,
        ) -> Result<AuditVerdict, AgentError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AgentError::Provider("audit script exhausted".to_string())))
        }
    }

    struct ScriptedGatekeeper(Mutex<VecDeque<Result<Score, AgentError>>>);

    #[async_trait]
    impl Gatekeeper for ScriptedGatekeeper {
        async fn score(
            &self,
            _ctx: &AgentContext,
            _candidate: &Candidate,
        ) -> Result<Score, AgentError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AgentError::Provider("score script exhausted".to_string())))
        }
    }

    fn proposes(c: &str) -> Result<Proposal, AgentError> {
        Ok(Proposal::Candidate {
            candidate: Candidate::new(c, serde_json::json!({"rate": 1850.0})),
            reasoning: "closest available".to_string(),
            usage: None,
        })
    }

    fn accepts() -> Result<AuditVerdict, AgentError> {
        Ok(AuditVerdict {
            accepted: true,
            reasons: vec![],
            reasoning: "compliant".to_string(),
            usage: None,
        })
    }

    fn rejects(reason: &str) -> Result<AuditVerdict, AgentError> {
        Ok(AuditVerdict {
            accepted: false,
            reasons: vec![reason.to_string()],
            reasoning: reason.to_string(),
            usage: None,
        })
    }

    fn scores(v: f64) -> Result<Score, AgentError> {
        Ok(Score {
            value: v,
            reasoning: format!("margin {:.1}%", v),
            usage: None,
        })
    }

    fn agent_set(
        proposals: Vec<Result<Proposal, AgentError>>,
        verdicts: Vec<Result<AuditVerdict, AgentError>>,
        metrics: Vec<Result<Score, AgentError>>,
    ) -> AgentSet {
        AgentSet {
            proposer: Arc::new(ScriptedProposer(Mutex::new(proposals.into()))),
            auditor: Arc::new(ScriptedAuditor(Mutex::new(verdicts.into()))),
            gatekeeper: Arc::new(ScriptedGatekeeper(Mutex::new(metrics.into()))),
        }
    }

    fn spec(max_attempts: u32, gate: GatePolicy) -> WorkflowSpec {
        let mut spec = WorkflowSpec::new("assign-driver")
            .with_max_attempts(max_attempts)
            .with_gate(gate)
            .with_commit_kind("assignment");
        spec.call_timeout_secs = 5;
        spec.call_retries = 1;
        spec
    }

    fn setup() -> (Engine, Database, RecordingCommitStore) {
        let db = Database::open_in_memory().unwrap();
        let door = GlassDoor::new(db.clone());
        let store = RecordingCommitStore::default();
        let engine = Engine::new(db.clone(), door, Arc::new(store.clone()));
        (engine, db, store)
    }

    fn start(db: &Database, spec: &WorkflowSpec) -> Run {
        db.start_run(
            &spec.name,
            "tenant-1",
            &serde_json::json!({"load_id": "L-100"}),
            spec.max_attempts,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_audit_rejection_then_success() {
        // Proposer yields C1, auditor rejects it, C2 passes audit and
        // the gate approves at 16% against a 15% floor
        let (engine, db, store) = setup();
        let spec = spec(3, GatePolicy::margin_floor(15.0, None));
        let run = start(&db, &spec);

        let agents = agent_set(
            vec![proposes("C1"), proposes("C2")],
            vec![rejects("insufficient capacity"), accepts()],
            vec![scores(16.0)],
        );

        let done = engine.execute(&spec, &agents, run).await.unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(done.attempt, 1);
        assert_eq!(done.excluded, vec!["C1".to_string()]);

        let commits = store.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].1, "C2");
    }

    #[tokio::test]
    async fn test_threshold_exhaustion_fails() {
        // Both candidates clear audit but score below the 10% floor;
        // the attempt budget of 2 runs out
        let (engine, db, store) = setup();
        let spec = spec(2, GatePolicy::margin_floor(10.0, None));
        let run = start(&db, &spec);

        let agents = agent_set(
            vec![proposes("C1"), proposes("C2")],
            vec![accepts(), accepts()],
            vec![scores(8.0), scores(9.0)],
        );

        let done = engine.execute(&spec, &agents, run).await.unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Failed));
        assert_eq!(done.reason.as_deref(), Some(REASON_THRESHOLD));
        assert_eq!(done.attempt, 2);
        assert!(store.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_then_reviewer_approval() {
        // A score in the 10-15% band escalates; the reviewer approves
        // and the terminal write fires once
        let (engine, db, store) = setup();
        let spec = spec(3, GatePolicy::margin_floor(10.0, Some(15.0)));
        let workflows = HashMap::from([(spec.name.clone(), spec.clone())]);
        let run = start(&db, &spec);

        let agents = agent_set(vec![proposes("C1")], vec![accepts()], vec![scores(12.0)]);

        let parked = engine.execute(&spec, &agents, run).await.unwrap();
        assert_eq!(parked.phase, RunPhase::Escalated);
        assert!(parked.outcome.is_none());
        assert!(store.commits.lock().unwrap().is_empty());

        let approval = db.get_approval_for_run(&parked.id).unwrap().unwrap();
        assert_eq!(approval.urgency, UrgencyTier::Medium);
        assert_eq!(approval.amount, Some(1850.0));

        let done = engine
            .resolve_approval(&workflows, &approval.id, true, "ops@example.com")
            .await
            .unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(store.commits.lock().unwrap().len(), 1);

        // A second resolution is refused
        let again = engine
            .resolve_approval(&workflows, &approval.id, false, "other")
            .await;
        assert!(again.is_err());
        assert_eq!(store.commits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reviewer_rejection_fails_run() {
        let (engine, db, store) = setup();
        let spec = spec(3, GatePolicy::margin_floor(10.0, Some(15.0)));
        let workflows = HashMap::from([(spec.name.clone(), spec.clone())]);
        let run = start(&db, &spec);

        let agents = agent_set(vec![proposes("C1")], vec![accepts()], vec![scores(12.0)]);
        let parked = engine.execute(&spec, &agents, run).await.unwrap();
        let approval = db.get_approval_for_run(&parked.id).unwrap().unwrap();

        let done = engine
            .resolve_approval(&workflows, &approval.id, false, "ops@example.com")
            .await
            .unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Failed));
        assert_eq!(done.reason.as_deref(), Some(REASON_REVIEWER_REJECTED));
        assert!(store.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_timeouts_fail_with_unavailable() {
        // Infrastructure failure is never escalated and carries a
        // reason distinct from a business rejection
        let (engine, db, store) = setup();
        let spec = spec(3, GatePolicy::approve_all());
        let run = start(&db, &spec);

        let timeout = || Err(AgentError::Timeout(Duration::from_secs(5)));
        let agents = agent_set(vec![timeout(), timeout(), timeout()], vec![], vec![]);

        let done = engine.execute(&spec, &agents, run).await.unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Failed));
        assert_eq!(done.reason.as_deref(), Some(REASON_UNAVAILABLE));
        assert!(store.commits.lock().unwrap().is_empty());

        // The failed call is still durably recorded as a step
        let steps = db.get_steps(&done.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].outcome, StepOutcome::Error);
    }

    #[tokio::test]
    async fn test_repeated_rejected_candidate_fails() {
        // The proposer re-offers C1 after its rejection; the run fails
        // instead of looping
        let (engine, db, store) = setup();
        let spec = spec(5, GatePolicy::approve_all());
        let run = start(&db, &spec);

        let agents = agent_set(
            vec![proposes("C1"), proposes("C1")],
            vec![rejects("out of hours")],
            vec![],
        );

        let done = engine.execute(&spec, &agents, run).await.unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Failed));
        assert_eq!(done.reason.as_deref(), Some(REASON_NO_CANDIDATE));
        assert!(done.attempt <= done.max_attempts);
        assert!(store.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_candidate_fails() {
        let (engine, db, _store) = setup();
        let spec = spec(3, GatePolicy::approve_all());
        let run = start(&db, &spec);

        let agents = agent_set(
            vec![Ok(Proposal::NoCandidate {
                reason: "all drivers committed".to_string(),
            })],
            vec![],
            vec![],
        );

        let done = engine.execute(&spec, &agents, run).await.unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Failed));
        assert_eq!(done.reason.as_deref(), Some(REASON_NO_CANDIDATE));
    }

    #[tokio::test]
    async fn test_audit_exhaustion_fails() {
        let (engine, db, _store) = setup();
        let spec = spec(2, GatePolicy::approve_all());
        let run = start(&db, &spec);

        let agents = agent_set(
            vec![proposes("C1"), proposes("C2")],
            vec![rejects("insufficient capacity"), rejects("expired medical card")],
            vec![],
        );

        let done = engine.execute(&spec, &agents, run).await.unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Failed));
        assert_eq!(done.reason.as_deref(), Some(REASON_NO_CANDIDATE));
        assert_eq!(done.attempt, 2);
        assert_eq!(done.excluded, vec!["C1".to_string(), "C2".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_before_execute() {
        let (engine, db, store) = setup();
        let spec = spec(3, GatePolicy::approve_all());
        let run = start(&db, &spec);

        db.request_cancel(&run.id).unwrap();
        let fresh = db.get_run(&run.id).unwrap().unwrap();

        let done = engine.execute(&spec, &agent_set(vec![], vec![], vec![]), fresh)
            .await
            .unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Cancelled));
        assert!(store.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_in_escalated_never_commits() {
        // Even an approval granted after cancellation must not fire
        // the terminal write
        let (engine, db, store) = setup();
        let spec = spec(3, GatePolicy::margin_floor(10.0, Some(15.0)));
        let workflows = HashMap::from([(spec.name.clone(), spec.clone())]);
        let run = start(&db, &spec);

        let agents = agent_set(vec![proposes("C1")], vec![accepts()], vec![scores(12.0)]);
        let parked = engine.execute(&spec, &agents, run).await.unwrap();
        let approval = db.get_approval_for_run(&parked.id).unwrap().unwrap();

        db.request_cancel(&parked.id).unwrap();

        let result = engine
            .resolve_approval(&workflows, &approval.id, true, "ops@example.com")
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled(_))));
        assert!(store.commits.lock().unwrap().is_empty());

        let done = db.get_run(&parked.id).unwrap().unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_step_seqs_gapless_across_full_run() {
        let (engine, db, _store) = setup();
        let spec = spec(3, GatePolicy::margin_floor(15.0, None));
        let run = start(&db, &spec);

        let agents = agent_set(
            vec![proposes("C1"), proposes("C2")],
            vec![rejects("insufficient capacity"), accepts()],
            vec![scores(16.0)],
        );
        let done = engine.execute(&spec, &agents, run).await.unwrap();

        let steps = db.get_steps(&done.id).unwrap();
        let seqs: Vec<u64> = steps.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_events_tell_the_story() {
        let (engine, db, _store) = setup();
        let spec = spec(3, GatePolicy::margin_floor(15.0, None));
        let run = start(&db, &spec);

        let agents = agent_set(
            vec![proposes("C1"), proposes("C2")],
            vec![rejects("insufficient capacity"), accepts()],
            vec![scores(16.0)],
        );
        let done = engine.execute(&spec, &agents, run).await.unwrap();

        let events = db.events_after(&done.id, 0).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());

        assert!(events.iter().any(|e| e.kind == EventKind::Rejection));
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Result);
        assert_eq!(last.severity, Severity::Success);
    }

    struct FailingCommitStore;

    #[async_trait]
    impl CommitStore for FailingCommitStore {
        async fn commit(&self, _run: &Run, _candidate: &Candidate) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("dispatch backend unreachable"))
        }
    }

    #[tokio::test]
    async fn test_commit_failure_fails_run_and_releases_marker() {
        // A run whose side effect cannot be applied must not finalize
        // succeeded, and must not leave the marker claimed with no
        // write behind it
        let db = Database::open_in_memory().unwrap();
        let door = GlassDoor::new(db.clone());
        let engine = Engine::new(db.clone(), door, Arc::new(FailingCommitStore));
        let spec = spec(3, GatePolicy::approve_all());
        let run = start(&db, &spec);

        let agents = agent_set(vec![proposes("C1")], vec![accepts()], vec![scores(20.0)]);
        let done = engine.execute(&spec, &agents, run).await.unwrap();

        assert_eq!(done.outcome, Some(RunOutcome::Failed));
        assert_eq!(done.reason.as_deref(), Some(REASON_COMMIT_FAILED));
        assert!(!db.is_committed(&done.id).unwrap());
    }

    async fn wait_terminal(db: &Database, run_id: &str) -> Run {
        for _ in 0..200 {
            let run = db.get_run(run_id).unwrap().unwrap();
            if run.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never reached a terminal state");
    }

    #[tokio::test]
    async fn test_restart_resumes_orphaned_runs() {
        let (engine, db, store) = setup();
        let spec = spec(3, GatePolicy::approve_all());
        let workflows = HashMap::from([(spec.name.clone(), spec.clone())]);

        // A run no task owns, as after a crash
        let run = start(&db, &spec);

        let agents = agent_set(vec![proposes("C1")], vec![accepts()], vec![scores(20.0)]);
        let resumed = engine.resume_unfinished(&workflows, &agents).await.unwrap();
        assert_eq!(resumed, 1);

        let done = wait_terminal(&db, &run.id).await;
        assert_eq!(done.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(store.commits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_skips_parked_runs_and_fails_removed_workflows() {
        let (engine, db, _store) = setup();
        let spec = spec(3, GatePolicy::margin_floor(10.0, Some(15.0)));
        let workflows = HashMap::from([(spec.name.clone(), spec.clone())]);

        // One run parked for review, one orphan whose workflow is gone
        let agents = agent_set(vec![proposes("C1")], vec![accepts()], vec![scores(12.0)]);
        let parked = engine
            .execute(&spec, &agents, start(&db, &spec))
            .await
            .unwrap();
        assert_eq!(parked.phase, RunPhase::Escalated);

        let orphan = db
            .start_run("retired-flow", "tenant-1", &serde_json::json!({}), 3)
            .unwrap();

        let resumed = engine
            .resume_unfinished(&workflows, &agent_set(vec![], vec![], vec![]))
            .await
            .unwrap();
        assert_eq!(resumed, 1);

        let still_parked = db.get_run(&parked.id).unwrap().unwrap();
        assert_eq!(still_parked.phase, RunPhase::Escalated);

        let failed = db.get_run(&orphan.id).unwrap().unwrap();
        assert_eq!(failed.outcome, Some(RunOutcome::Failed));
        assert_eq!(failed.reason.as_deref(), Some(REASON_WORKFLOW_REMOVED));
    }

    #[tokio::test]
    async fn test_steps_recorded_before_their_events() {
        let (engine, db, _store) = setup();
        let spec = spec(3, GatePolicy::approve_all());
        let run = start(&db, &spec);

        let agents = agent_set(vec![proposes("C1")], vec![accepts()], vec![scores(20.0)]);
        let done = engine.execute(&spec, &agents, run).await.unwrap();

        let steps = db.get_steps(&done.id).unwrap();
        let thinking: Vec<_> = db
            .events_after(&done.id, 0)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EventKind::Thinking)
            .collect();
        assert_eq!(thinking.len(), 2);

        // Each step row exists by the time the event announcing it
        // publishes
        for (step, event) in steps.iter().zip(&thinking) {
            assert!(step.started_at <= event.timestamp);
        }
    }
}
