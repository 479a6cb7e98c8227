use std::collections::BTreeMap;

use data_model::{
    JobCondition,
    JobKey,
    JobPhase,
    JobStatus,
    ProcessPhase,
    ReplicaStatus,
    ReplicaType,
    RestartPolicy,
    WorkerProcess,
};
use itertools::Itertools;

use crate::restart_policy::{is_clean_exit, is_fatal_failure};

pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Per-sync tally of process phases for one replica type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub desired: u32,
    /// Pending, Running or Unknown.
    pub active: u32,
    pub running: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Failures that fail the job under the replica type's policy.
    pub fatal: u32,
    pub retired: BTreeMap<u32, i32>,
}

impl ReplicaCounts {
    pub fn new(desired: u32) -> Self {
        Self {
            desired,
            ..Default::default()
        }
    }

    pub fn observe(&mut self, process: &WorkerProcess, policy: RestartPolicy) {
        match process.phase {
            ProcessPhase::Pending | ProcessPhase::Unknown => self.active += 1,
            ProcessPhase::Running => {
                self.active += 1;
                self.running += 1;
            }
            ProcessPhase::Succeeded => self.succeeded += 1,
            ProcessPhase::Failed => {
                self.failed += 1;
                if is_fatal_failure(policy, process) {
                    self.fatal += 1;
                }
            }
        }
    }

    /// Counts an index whose process was removed by the controller.
    pub fn observe_retired(&mut self, index: u32, exit_code: i32) {
        self.retired.insert(index, exit_code);
        if is_clean_exit(exit_code) {
            self.succeeded += 1;
        } else {
            self.failed += 1;
            self.fatal += 1;
        }
    }

    /// Every desired index is accounted for by a live or non-fatally
    /// finished replica.
    pub fn is_satisfied(&self) -> bool {
        self.fatal == 0 && self.active + self.succeeded >= self.desired
    }
}

pub type CountsSnapshot = BTreeMap<ReplicaType, ReplicaCounts>;

/// Folds the counts of every replica type into one job phase. A fatal
/// failure anywhere wins over completion, completion over progress.
pub fn aggregate_phase(counts: &CountsSnapshot) -> JobPhase {
    if counts.values().any(|c| c.fatal > 0) {
        return JobPhase::Failed;
    }
    if !counts.is_empty() && counts.values().all(|c| c.succeeded == c.desired) {
        return JobPhase::Succeeded;
    }
    if counts.values().any(|c| c.running > 0) {
        return JobPhase::Running;
    }
    JobPhase::Created
}

/// Computes the job status for `counts`, starting from `current`. A
/// condition is appended only when the phase changes.
pub fn next_status(key: &JobKey, current: &JobStatus, counts: &CountsSnapshot, now: u64) -> JobStatus {
    let mut status = current.clone();
    status.replica_statuses = counts
        .iter()
        .map(|(rt, c)| {
            (
                rt.clone(),
                ReplicaStatus {
                    active: c.active,
                    succeeded: c.succeeded,
                    failed: c.failed,
                    retired: c.retired.clone(),
                },
            )
        })
        .collect();

    let phase = aggregate_phase(counts);
    let message = match phase {
        JobPhase::Failed => {
            let failed = counts
                .iter()
                .filter(|(_, c)| c.fatal > 0)
                .map(|(rt, _)| rt.as_str())
                .join(", ");
            format!("job {} failed: replicas of {} failed", key, failed)
        }
        JobPhase::Succeeded => format!("job {} completed successfully", key),
        JobPhase::Running => format!("job {} is running", key),
        JobPhase::Created => format!("job {} is created", key),
    };
    transition(&mut status, phase, &format!("TrainJob{}", phase), &message, now);
    status
}

/// Marks the job failed because its spec can never be materialized.
pub fn invalid_spec_status(current: &JobStatus, message: &str, now: u64) -> JobStatus {
    let mut status = current.clone();
    transition(&mut status, JobPhase::Failed, REASON_INVALID_SPEC, message, now);
    status
}

fn transition(status: &mut JobStatus, phase: JobPhase, reason: &str, message: &str, now: u64) {
    if status.phase == Some(phase) {
        return;
    }
    status.phase = Some(phase);
    status.conditions.push(JobCondition {
        condition_type: phase,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now,
    });
    if phase != JobPhase::Created && status.start_time.is_none() {
        status.start_time = Some(now);
    }
    if phase.is_terminal() {
        status.completion_time = Some(now);
    }
}
