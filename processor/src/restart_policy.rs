use data_model::{
    ProcessPhase,
    ProcessRestartPolicy,
    ProcessTemplate,
    RestartPolicy,
    WorkerProcess,
    CLEAN_SHUTDOWN_EXIT_CODE,
};

/// What the controller does with a process it observes after termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationAction {
    /// Left to the orchestration layer's own restart directive.
    Leave,
    /// Deleted and retired; the replica is not considered failed.
    DeleteNonFatal { exit_code: i32 },
    /// Deleted and retired; the job fails.
    DeleteFatal { exit_code: i32 },
}

pub fn process_restart_policy(policy: RestartPolicy) -> ProcessRestartPolicy {
    match policy {
        RestartPolicy::Always => ProcessRestartPolicy::Always,
        RestartPolicy::OnFailure => ProcessRestartPolicy::OnFailure,
        RestartPolicy::Never => ProcessRestartPolicy::Never,
        // the controller decides on exit codes, so the process must not be
        // restarted in place
        RestartPolicy::ExitCode => ProcessRestartPolicy::Never,
        RestartPolicy::Unspecified => ProcessRestartPolicy::Never,
    }
}

pub fn set_restart_policy(template: &mut ProcessTemplate, policy: RestartPolicy) {
    template.restart_policy = Some(process_restart_policy(policy));
}

pub fn is_clean_exit(exit_code: i32) -> bool {
    exit_code == 0 || exit_code == CLEAN_SHUTDOWN_EXIT_CODE
}

pub fn termination_action(policy: RestartPolicy, process: &WorkerProcess) -> TerminationAction {
    if policy != RestartPolicy::ExitCode || process.phase != ProcessPhase::Failed {
        return TerminationAction::Leave;
    }
    match process.main_container_exit_code() {
        Some(exit_code) if is_clean_exit(exit_code) => {
            TerminationAction::DeleteNonFatal { exit_code }
        }
        Some(exit_code) => TerminationAction::DeleteFatal { exit_code },
        // nothing to inspect yet; counted as a failure and kept for diagnosis
        None => TerminationAction::Leave,
    }
}

/// Whether a process in the Failed phase fails its job.
pub fn is_fatal_failure(policy: RestartPolicy, process: &WorkerProcess) -> bool {
    if process.phase != ProcessPhase::Failed {
        return false;
    }
    match policy {
        RestartPolicy::ExitCode => !matches!(
            termination_action(policy, process),
            TerminationAction::DeleteNonFatal { .. }
        ),
        _ => true,
    }
}
