//! Run store: durable records of workflow runs, steps, events, and
//! approval requests
//!
//! All mutations are single-writer per run, enforced by an optimistic
//! version check: an update carrying a stale version fails with
//! `StoreError::VersionConflict` and the caller retries with fresh
//! state. A run whose outcome is set is immutable — later writes are
//! rejected, which protects against duplicate side effects from
//! retried network calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Database, StoreError};
use crate::agents::{AgentRole, Candidate, TokenUsage};
use crate::events::{EventDraft, StreamEvent};
use crate::gate::UrgencyTier;

// ============================================================================
// Data Types
// ============================================================================

/// Where a run currently is in the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Running,
    Auditing,
    Gating,
    Retrying,
    Escalated,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Running => write!(f, "running"),
            RunPhase::Auditing => write!(f, "auditing"),
            RunPhase::Gating => write!(f, "gating"),
            RunPhase::Retrying => write!(f, "retrying"),
            RunPhase::Escalated => write!(f, "escalated"),
            RunPhase::Succeeded => write!(f, "succeeded"),
            RunPhase::Failed => write!(f, "failed"),
            RunPhase::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "running" => Ok(RunPhase::Running),
            "auditing" => Ok(RunPhase::Auditing),
            "gating" => Ok(RunPhase::Gating),
            "retrying" => Ok(RunPhase::Retrying),
            "escalated" => Ok(RunPhase::Escalated),
            "succeeded" => Ok(RunPhase::Succeeded),
            "failed" => Ok(RunPhase::Failed),
            "cancelled" => Ok(RunPhase::Cancelled),
            _ => Err(anyhow::anyhow!("Unknown run phase: {}", s)),
        }
    }
}

/// Terminal outcome of a run
///
/// An escalated run has no outcome yet; it is durably suspended until
/// a reviewer acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "succeeded"),
            RunOutcome::Failed => write!(f, "failed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "succeeded" => Ok(RunOutcome::Succeeded),
            "failed" => Ok(RunOutcome::Failed),
            "cancelled" => Ok(RunOutcome::Cancelled),
            _ => Err(anyhow::anyhow!("Unknown run outcome: {}", s)),
        }
    }
}

/// A workflow run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workflow: String,
    pub tenant_id: String,
    pub input: serde_json::Value,
    pub phase: RunPhase,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Candidate currently under consideration
    pub candidate: Option<Candidate>,
    /// Candidate identities rejected earlier in this run
    pub excluded: Vec<String>,
    pub outcome: Option<RunOutcome>,
    pub reason: Option<String>,
    pub cancel_requested: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Summary view of a run (for listing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub workflow: String,
    pub tenant_id: String,
    pub phase: RunPhase,
    pub attempt: u32,
    pub outcome: Option<RunOutcome>,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow: Option<String>,
    pub phase: Option<RunPhase>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Outcome of one agent invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    /// Step recorded, agent call still in flight
    Pending,
    Approved,
    Rejected,
    Error,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepOutcome::Pending => write!(f, "pending"),
            StepOutcome::Approved => write!(f, "approved"),
            StepOutcome::Rejected => write!(f, "rejected"),
            StepOutcome::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for StepOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(StepOutcome::Pending),
            "approved" => Ok(StepOutcome::Approved),
            "rejected" => Ok(StepOutcome::Rejected),
            "error" => Ok(StepOutcome::Error),
            _ => Err(anyhow::anyhow!("Unknown step outcome: {}", s)),
        }
    }
}

/// One agent invocation within a run, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub seq: u64,
    pub role: AgentRole,
    pub input_summary: String,
    pub output_summary: Option<String>,
    pub reasoning: Option<String>,
    pub outcome: StepOutcome,
    pub duration_ms: Option<i64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Status of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            _ => Err(anyhow::anyhow!("Unknown approval status: {}", s)),
        }
    }
}

/// A suspended run awaiting a human decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    pub urgency: UrgencyTier,
    pub recommended_action: String,
    pub amount: Option<f64>,
    pub status: ApprovalStatus,
    pub reviewer: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Database Operations
// ============================================================================

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Database {
    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    /// Create a new run (phase = running)
    pub fn start_run(
        &self,
        workflow: &str,
        tenant_id: &str,
        input: &serde_json::Value,
        max_attempts: u32,
    ) -> Result<Run, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO runs (id, workflow, tenant_id, input, phase, attempt, max_attempts,
                              excluded, cancel_requested, version, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, '[]', 0, 0, ?7)
            "#,
            (
                &id,
                workflow,
                tenant_id,
                serde_json::to_string(input)?,
                RunPhase::Running.to_string(),
                max_attempts,
                now.to_rfc3339(),
            ),
        )?;

        Ok(Run {
            id,
            workflow: workflow.to_string(),
            tenant_id: tenant_id.to_string(),
            input: input.clone(),
            phase: RunPhase::Running,
            attempt: 0,
            max_attempts,
            candidate: None,
            excluded: Vec::new(),
            outcome: None,
            reason: None,
            cancel_requested: false,
            version: 0,
            created_at: now,
            completed_at: None,
        })
    }

    /// Get a run by id
    pub fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, workflow, tenant_id, input, phase, attempt, max_attempts,
                   candidate, excluded, outcome, reason, cancel_requested, version,
                   created_at, completed_at
            FROM runs
            WHERE id = ?1
            "#,
        )?;

        let result = stmt.query_row([id], map_run_row);

        match result {
            Ok(run) => Ok(Some(run)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs with no outcome that are not parked for review
    ///
    /// These are the runs a restart must re-enter; escalated runs keep
    /// waiting for their reviewer.
    pub fn list_unfinished_runs(&self) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, workflow, tenant_id, input, phase, attempt, max_attempts,
                   candidate, excluded, outcome, reason, cancel_requested, version,
                   created_at, completed_at
            FROM runs
            WHERE outcome IS NULL AND phase != ?1
            ORDER BY created_at ASC
            "#,
        )?;

        let runs = stmt
            .query_map([RunPhase::Escalated.to_string()], map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    /// List runs with optional filters
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let conn = self.conn();
        let limit = filter.limit.unwrap_or(50);
        let offset = filter.offset.unwrap_or(0);

        let mut sql = String::from(
            r#"
            SELECT id, workflow, tenant_id, phase, attempt, outcome, created_at
            FROM runs
            WHERE 1=1
            "#,
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(ref workflow) = filter.workflow {
            sql.push_str(" AND workflow = ?");
            params.push(Box::new(workflow.clone()));
        }
        if let Some(phase) = filter.phase {
            sql.push_str(" AND phase = ?");
            params.push(Box::new(phase.to_string()));
        }

        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        params.push(Box::new(limit));
        params.push(Box::new(offset));

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let runs = stmt
            .query_map(params_refs.as_slice(), |row| {
                let phase_str: String = row.get(3)?;
                let outcome_str: Option<String> = row.get(5)?;
                let created_at: String = row.get(6)?;

                Ok(RunSummary {
                    id: row.get(0)?,
                    workflow: row.get(1)?,
                    tenant_id: row.get(2)?,
                    phase: phase_str.parse().unwrap_or(RunPhase::Running),
                    attempt: row.get(4)?,
                    outcome: outcome_str.and_then(|s| s.parse().ok()),
                    created_at: parse_ts(&created_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    /// Persist a run mutation under the optimistic version check
    ///
    /// On success the run's version is advanced in place. Fails with
    /// `VersionConflict` if another writer got there first, and with
    /// `TerminalRun` if the run already has an outcome.
    pub fn update_run(&self, run: &mut Run) -> Result<(), StoreError> {
        let completed_at = if run.outcome.is_some() && run.completed_at.is_none() {
            Some(Utc::now())
        } else {
            run.completed_at
        };

        let conn = self.conn();
        let changed = conn.execute(
            r#"
            UPDATE runs
            SET phase = ?1, attempt = ?2, candidate = ?3, excluded = ?4,
                outcome = ?5, reason = ?6, cancel_requested = ?7,
                completed_at = ?8, version = version + 1
            WHERE id = ?9 AND version = ?10 AND outcome IS NULL
            "#,
            (
                run.phase.to_string(),
                run.attempt,
                run.candidate
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&run.excluded)?,
                run.outcome.map(|o| o.to_string()),
                run.reason.clone(),
                run.cancel_requested as i64,
                completed_at.map(|dt| dt.to_rfc3339()),
                &run.id,
                run.version,
            ),
        )?;

        if changed == 0 {
            let existing: Option<Option<String>> = conn
                .query_row("SELECT outcome FROM runs WHERE id = ?1", [&run.id], |row| {
                    row.get(0)
                })
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            return match existing {
                None => Err(StoreError::NotFound(run.id.clone())),
                Some(Some(_)) => Err(StoreError::TerminalRun(run.id.clone())),
                Some(None) => Err(StoreError::VersionConflict(run.id.clone())),
            };
        }

        run.version += 1;
        run.completed_at = completed_at;
        Ok(())
    }

    /// Mark a run for cancellation
    ///
    /// Bumps the version so the owning engine task hits a conflict on
    /// its next write and reloads fresh state, where it sees the flag.
    /// A run whose commit marker is already claimed is past the point
    /// of no return and refuses the cancel as `TerminalRun`.
    pub fn request_cancel(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE runs SET cancel_requested = 1, version = version + 1
             WHERE id = ?1 AND outcome IS NULL
               AND id NOT IN (SELECT run_id FROM commits)",
            [id],
        )?;

        if changed == 0 {
            let exists: bool = conn
                .query_row("SELECT 1 FROM runs WHERE id = ?1", [id], |_| Ok(true))
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(false),
                    other => Err(other),
                })?;
            return if exists {
                Err(StoreError::TerminalRun(id.to_string()))
            } else {
                Err(StoreError::NotFound(id.to_string()))
            };
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------------

    /// Record a step before its agent call is dispatched
    ///
    /// A crash mid-call still leaves a durable "step started" row.
    /// Sequence numbers are gapless and strictly increasing per run.
    pub fn begin_step(
        &self,
        run_id: &str,
        role: AgentRole,
        input_summary: &str,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let conn = self.conn();

        let seq: u64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM steps WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;

        conn.execute(
            r#"
            INSERT INTO steps (run_id, seq, role, input_summary, outcome, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            (
                run_id,
                seq,
                role.to_string(),
                input_summary,
                StepOutcome::Pending.to_string(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(seq)
    }

    /// Finalize a step when its agent call returns or times out
    #[allow(clippy::too_many_arguments)]
    pub fn finish_step(
        &self,
        run_id: &str,
        seq: u64,
        outcome: StepOutcome,
        output_summary: &str,
        reasoning: Option<&str>,
        duration_ms: i64,
        usage: Option<TokenUsage>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            r#"
            UPDATE steps
            SET outcome = ?1, output_summary = ?2, reasoning = ?3, duration_ms = ?4,
                tokens_in = ?5, tokens_out = ?6, finished_at = ?7
            WHERE run_id = ?8 AND seq = ?9
            "#,
            (
                outcome.to_string(),
                output_summary,
                reasoning,
                duration_ms,
                usage.map(|u| u.tokens_in as i64),
                usage.map(|u| u.tokens_out as i64),
                now.to_rfc3339(),
                run_id,
                seq,
            ),
        )?;

        Ok(())
    }

    /// Get all steps for a run in sequence order
    pub fn get_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, seq, role, input_summary, output_summary, reasoning,
                   outcome, duration_ms, tokens_in, tokens_out, started_at, finished_at
            FROM steps
            WHERE run_id = ?1
            ORDER BY seq ASC
            "#,
        )?;

        let steps = stmt
            .query_map([run_id], |row| {
                let role_str: String = row.get(2)?;
                let outcome_str: String = row.get(6)?;
                let started_at: String = row.get(10)?;
                let finished_at: Option<String> = row.get(11)?;

                Ok(StepRecord {
                    run_id: row.get(0)?,
                    seq: row.get(1)?,
                    role: role_str.parse().unwrap_or(AgentRole::Proposer),
                    input_summary: row.get(3)?,
                    output_summary: row.get(4)?,
                    reasoning: row.get(5)?,
                    outcome: outcome_str.parse().unwrap_or(StepOutcome::Pending),
                    duration_ms: row.get(7)?,
                    tokens_in: row.get(8)?,
                    tokens_out: row.get(9)?,
                    started_at: parse_ts(&started_at),
                    finished_at: finished_at.map(|s| parse_ts(&s)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(steps)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Append an event to the durable per-run log, assigning the next
    /// sequence number
    ///
    /// Callers serialize appends per run (the glass door holds its
    /// per-run lock across append-then-broadcast).
    pub fn append_event(&self, run_id: &str, draft: &EventDraft) -> Result<StreamEvent, StoreError> {
        let now = Utc::now();
        let conn = self.conn();

        let seq: u64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;

        conn.execute(
            r#"
            INSERT INTO run_events (run_id, seq, kind, role, message, reasoning, severity, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            (
                run_id,
                seq,
                draft.kind.to_string(),
                draft.role.map(|r| r.to_string()),
                &draft.message,
                draft.reasoning.as_deref(),
                draft.severity.to_string(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(StreamEvent {
            run_id: run_id.to_string(),
            seq,
            kind: draft.kind,
            role: draft.role,
            message: draft.message.clone(),
            reasoning: draft.reasoning.clone(),
            severity: draft.severity,
            timestamp: now,
        })
    }

    /// Read the event log after a given sequence number, in order
    pub fn events_after(&self, run_id: &str, after_seq: u64) -> Result<Vec<StreamEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, seq, kind, role, message, reasoning, severity, timestamp
            FROM run_events
            WHERE run_id = ?1 AND seq > ?2
            ORDER BY seq ASC
            "#,
        )?;

        let events = stmt
            .query_map((run_id, after_seq), |row| {
                let kind_str: String = row.get(2)?;
                let role_str: Option<String> = row.get(3)?;
                let severity_str: String = row.get(6)?;
                let timestamp: String = row.get(7)?;

                Ok(StreamEvent {
                    run_id: row.get(0)?,
                    seq: row.get(1)?,
                    kind: kind_str.parse().unwrap_or(crate::events::EventKind::Decision),
                    role: role_str.and_then(|s| s.parse().ok()),
                    message: row.get(4)?,
                    reasoning: row.get(5)?,
                    severity: severity_str.parse().unwrap_or(crate::events::Severity::Info),
                    timestamp: parse_ts(&timestamp),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Highest assigned event sequence number for a run (0 if none)
    pub fn last_event_seq(&self, run_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn();
        let seq: u64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM run_events WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    // ------------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------------

    /// Create the pending approval request for an escalated run
    ///
    /// The unique index on run_id enforces one open request per run.
    pub fn create_approval(
        &self,
        run_id: &str,
        urgency: UrgencyTier,
        recommended_action: &str,
        amount: Option<f64>,
    ) -> Result<ApprovalRequest, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO approvals (id, run_id, urgency, recommended_action, amount, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            (
                &id,
                run_id,
                urgency.to_string(),
                recommended_action,
                amount,
                ApprovalStatus::Pending.to_string(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(ApprovalRequest {
            id,
            run_id: run_id.to_string(),
            urgency,
            recommended_action: recommended_action.to_string(),
            amount,
            status: ApprovalStatus::Pending,
            reviewer: None,
            reviewed_at: None,
            created_at: now,
        })
    }

    /// Get an approval request by id
    pub fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        self.query_approval("SELECT id, run_id, urgency, recommended_action, amount, status, reviewer, reviewed_at, created_at FROM approvals WHERE id = ?1", id)
    }

    /// Get the approval request associated with a run
    pub fn get_approval_for_run(&self, run_id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        self.query_approval("SELECT id, run_id, urgency, recommended_action, amount, status, reviewer, reviewed_at, created_at FROM approvals WHERE run_id = ?1", run_id)
    }

    fn query_approval(&self, sql: &str, key: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let result = stmt.query_row([key], map_approval_row);

        match result {
            Ok(approval) => Ok(Some(approval)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List approval requests, optionally filtered by status
    pub fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let conn = self.conn();

        let mut sql = String::from(
            "SELECT id, run_id, urgency, recommended_action, amount, status, reviewer, reviewed_at, created_at FROM approvals",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
        if let Some(status) = status {
            sql.push_str(" WHERE status = ?");
            params.push(Box::new(status.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let approvals = stmt
            .query_map(params_refs.as_slice(), map_approval_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(approvals)
    }

    /// Record a reviewer's decision on a pending request
    ///
    /// Only a pending request can be resolved; a second resolution
    /// fails with `AlreadyResolved`.
    pub fn resolve_approval(
        &self,
        id: &str,
        approved: bool,
        reviewer: &str,
    ) -> Result<ApprovalRequest, StoreError> {
        let now = Utc::now();
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };

        {
            let conn = self.conn();
            let changed = conn.execute(
                r#"
                UPDATE approvals
                SET status = ?1, reviewer = ?2, reviewed_at = ?3
                WHERE id = ?4 AND status = ?5
                "#,
                (
                    status.to_string(),
                    reviewer,
                    now.to_rfc3339(),
                    id,
                    ApprovalStatus::Pending.to_string(),
                ),
            )?;

            if changed == 0 {
                let exists: bool = conn
                    .query_row("SELECT 1 FROM approvals WHERE id = ?1", [id], |_| Ok(true))
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(false),
                        other => Err(other),
                    })?;
                return if exists {
                    Err(StoreError::AlreadyResolved(id.to_string()))
                } else {
                    Err(StoreError::NotFound(id.to_string()))
                };
            }
        }

        self.get_approval(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Commit markers
    // ------------------------------------------------------------------------

    /// Claim the terminal-write idempotency key for a run
    ///
    /// The claim is refused for a run that is terminal or has a cancel
    /// pending, atomically with those checks, so a commit can never
    /// race a cancellation. Returns true exactly once per run id; a
    /// replayed "succeeded" transition after a crash finds the marker
    /// and skips the write.
    pub fn try_mark_committed(&self, run_id: &str, commit_kind: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let conn = self.conn();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO commits (run_id, commit_kind, committed_at)
            SELECT ?1, ?2, ?3
            WHERE EXISTS (
                SELECT 1 FROM runs
                WHERE id = ?1 AND outcome IS NULL AND cancel_requested = 0
            )
            "#,
            (run_id, commit_kind, now.to_rfc3339()),
        )?;
        Ok(changed == 1)
    }

    /// Whether the terminal write for a run has been claimed
    pub fn is_committed(&self, run_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let exists = conn
            .query_row("SELECT 1 FROM commits WHERE run_id = ?1", [run_id], |_| {
                Ok(true)
            })
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;
        Ok(exists)
    }

    /// Release a claimed marker after a failed commit so a later
    /// attempt can claim it again
    pub fn clear_commit_marker(&self, run_id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute("DELETE FROM commits WHERE run_id = ?1", [run_id])?;
        Ok(())
    }
}

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let input_str: String = row.get(3)?;
    let phase_str: String = row.get(4)?;
    let candidate_str: Option<String> = row.get(7)?;
    let excluded_str: String = row.get(8)?;
    let outcome_str: Option<String> = row.get(9)?;
    let created_at: String = row.get(13)?;
    let completed_at: Option<String> = row.get(14)?;

    Ok(Run {
        id: row.get(0)?,
        workflow: row.get(1)?,
        tenant_id: row.get(2)?,
        input: serde_json::from_str(&input_str).unwrap_or(serde_json::Value::Null),
        phase: phase_str.parse().unwrap_or(RunPhase::Running),
        attempt: row.get(5)?,
        max_attempts: row.get(6)?,
        candidate: candidate_str.and_then(|s| serde_json::from_str(&s).ok()),
        excluded: serde_json::from_str(&excluded_str).unwrap_or_default(),
        outcome: outcome_str.and_then(|s| s.parse().ok()),
        reason: row.get(10)?,
        cancel_requested: row.get::<_, i64>(11)? != 0,
        version: row.get(12)?,
        created_at: parse_ts(&created_at),
        completed_at: completed_at.map(|s| parse_ts(&s)),
    })
}

fn map_approval_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let urgency_str: String = row.get(2)?;
    let status_str: String = row.get(5)?;
    let reviewed_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok(ApprovalRequest {
        id: row.get(0)?,
        run_id: row.get(1)?,
        urgency: urgency_str.parse().unwrap_or(UrgencyTier::Medium),
        recommended_action: row.get(3)?,
        amount: row.get(4)?,
        status: status_str.parse().unwrap_or(ApprovalStatus::Pending),
        reviewer: row.get(6)?,
        reviewed_at: reviewed_at.map(|s| parse_ts(&s)),
        created_at: parse_ts(&created_at),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDraft;
    use tempfile::{tempdir, TempDir};

    fn test_db() -> (Database, TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open_at(path).unwrap();
        (db, dir)
    }

    fn start(db: &Database) -> Run {
        db.start_run(
            "assign-driver",
            "tenant-1",
            &serde_json::json!({"load_id": "L-100"}),
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_start_and_get_run() {
        let (db, _dir) = test_db();
        let run = start(&db);

        assert_eq!(run.phase, RunPhase::Running);
        assert_eq!(run.attempt, 0);

        let fetched = db.get_run(&run.id).unwrap().unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.workflow, "assign-driver");
        assert_eq!(fetched.tenant_id, "tenant-1");
        assert!(fetched.excluded.is_empty());
    }

    #[test]
    fn test_update_run_advances_version() {
        let (db, _dir) = test_db();
        let mut run = start(&db);

        run.phase = RunPhase::Auditing;
        run.candidate = Some(Candidate::new("drv-1", serde_json::json!({})));
        db.update_run(&mut run).unwrap();
        assert_eq!(run.version, 1);

        let fetched = db.get_run(&run.id).unwrap().unwrap();
        assert_eq!(fetched.phase, RunPhase::Auditing);
        assert_eq!(fetched.candidate.unwrap().id, "drv-1");
        assert_eq!(fetched.version, 1);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let (db, _dir) = test_db();
        let run = start(&db);

        let mut copy_a = run.clone();
        let mut copy_b = run.clone();

        copy_a.phase = RunPhase::Auditing;
        db.update_run(&mut copy_a).unwrap();

        copy_b.phase = RunPhase::Gating;
        let err = db.update_run(&mut copy_b).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let (db, _dir) = test_db();
        let mut run = start(&db);

        run.phase = RunPhase::Failed;
        run.outcome = Some(RunOutcome::Failed);
        run.reason = Some("no eligible candidate".to_string());
        db.update_run(&mut run).unwrap();
        assert!(run.completed_at.is_some());

        run.phase = RunPhase::Succeeded;
        run.outcome = Some(RunOutcome::Succeeded);
        let err = db.update_run(&mut run).unwrap_err();
        assert!(matches!(err, StoreError::TerminalRun(_)));

        // The stored outcome is unchanged
        let fetched = db.get_run(&run.id).unwrap().unwrap();
        assert_eq!(fetched.outcome, Some(RunOutcome::Failed));
    }

    #[test]
    fn test_request_cancel_bumps_version() {
        let (db, _dir) = test_db();
        let mut run = start(&db);

        db.request_cancel(&run.id).unwrap();

        // The engine's stale copy now conflicts and must reload
        run.phase = RunPhase::Auditing;
        let err = db.update_run(&mut run).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));

        let fetched = db.get_run(&run.id).unwrap().unwrap();
        assert!(fetched.cancel_requested);
    }

    #[test]
    fn test_cancel_terminal_run_rejected() {
        let (db, _dir) = test_db();
        let mut run = start(&db);
        run.outcome = Some(RunOutcome::Succeeded);
        run.phase = RunPhase::Succeeded;
        db.update_run(&mut run).unwrap();

        let err = db.request_cancel(&run.id).unwrap_err();
        assert!(matches!(err, StoreError::TerminalRun(_)));
    }

    #[test]
    fn test_step_seqs_gapless_and_increasing() {
        let (db, _dir) = test_db();
        let run = start(&db);

        let s1 = db.begin_step(&run.id, AgentRole::Proposer, "propose").unwrap();
        let s2 = db.begin_step(&run.id, AgentRole::Auditor, "audit").unwrap();
        let s3 = db.begin_step(&run.id, AgentRole::Gatekeeper, "score").unwrap();
        assert_eq!((s1, s2, s3), (1, 2, 3));

        db.finish_step(&run.id, s2, StepOutcome::Rejected, "rejected", Some("hos"), 12, None)
            .unwrap();

        let steps = db.get_steps(&run.id).unwrap();
        assert_eq!(steps.len(), 3);
        let seqs: Vec<u64> = steps.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(steps[1].outcome, StepOutcome::Rejected);
        assert_eq!(steps[0].outcome, StepOutcome::Pending);
    }

    #[test]
    fn test_event_log_ordering_and_replay() {
        let (db, _dir) = test_db();
        let run = start(&db);

        for i in 0..5 {
            let event = db
                .append_event(&run.id, &EventDraft::result(format!("event {}", i)))
                .unwrap();
            assert_eq!(event.seq, i + 1);
        }

        assert_eq!(db.last_event_seq(&run.id).unwrap(), 5);

        let tail = db.events_after(&run.id, 3).unwrap();
        let seqs: Vec<u64> = tail.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_approval_lifecycle() {
        let (db, _dir) = test_db();
        let run = start(&db);

        let approval = db
            .create_approval(&run.id, UrgencyTier::Medium, "assign drv-2", Some(1850.0))
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);

        let pending = db.list_approvals(Some(ApprovalStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);

        let resolved = db.resolve_approval(&approval.id, true, "ops@example.com").unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.reviewer.as_deref(), Some("ops@example.com"));

        // A second resolution is refused
        let err = db.resolve_approval(&approval.id, false, "other").unwrap_err();
        assert!(matches!(err, StoreError::AlreadyResolved(_)));
    }

    #[test]
    fn test_one_approval_per_run() {
        let (db, _dir) = test_db();
        let run = start(&db);

        db.create_approval(&run.id, UrgencyTier::Low, "a", None).unwrap();
        let dup = db.create_approval(&run.id, UrgencyTier::Low, "b", None);
        assert!(dup.is_err());
    }

    #[test]
    fn test_commit_marker_claimed_once() {
        let (db, _dir) = test_db();
        let run = start(&db);

        assert!(db.try_mark_committed(&run.id, "assignment").unwrap());
        assert!(!db.try_mark_committed(&run.id, "assignment").unwrap());
        assert!(!db.try_mark_committed(&run.id, "assignment").unwrap());
        assert!(db.is_committed(&run.id).unwrap());
    }

    #[test]
    fn test_cancel_refused_once_commit_claimed() {
        let (db, _dir) = test_db();
        let run = start(&db);

        assert!(db.try_mark_committed(&run.id, "assignment").unwrap());

        // The terminal write is in flight; a cancel now is too late
        let err = db.request_cancel(&run.id).unwrap_err();
        assert!(matches!(err, StoreError::TerminalRun(_)));

        let fetched = db.get_run(&run.id).unwrap().unwrap();
        assert!(!fetched.cancel_requested);
    }

    #[test]
    fn test_commit_claim_refused_for_cancelled_run() {
        let (db, _dir) = test_db();
        let run = start(&db);

        db.request_cancel(&run.id).unwrap();

        assert!(!db.try_mark_committed(&run.id, "assignment").unwrap());
        assert!(!db.is_committed(&run.id).unwrap());
    }

    #[test]
    fn test_clear_commit_marker_frees_the_claim() {
        let (db, _dir) = test_db();
        let run = start(&db);

        assert!(db.try_mark_committed(&run.id, "assignment").unwrap());
        db.clear_commit_marker(&run.id).unwrap();

        assert!(!db.is_committed(&run.id).unwrap());
        assert!(db.try_mark_committed(&run.id, "assignment").unwrap());
    }

    #[test]
    fn test_list_unfinished_skips_parked_and_terminal_runs() {
        let (db, _dir) = test_db();
        let active = start(&db);

        let mut parked = start(&db);
        parked.phase = RunPhase::Escalated;
        db.update_run(&mut parked).unwrap();

        let mut finished = start(&db);
        finished.phase = RunPhase::Failed;
        finished.outcome = Some(RunOutcome::Failed);
        db.update_run(&mut finished).unwrap();

        let unfinished = db.list_unfinished_runs().unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, active.id);
    }
}
