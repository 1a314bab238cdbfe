/// Classification of a remote stack or event status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Failure,
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    pub kind: StatusKind,
    pub is_final: bool,
}

use StatusKind::{Failure, InProgress, Success};

/// Every status string CloudFormation reports for stacks and stack
/// events. Unknown strings classify as in-progress and non-final so the
/// poll loop keeps reading rather than mislabeling a new status.
static STATUS_TABLE: &[(&str, StatusKind, bool)] = &[
    ("CREATE_COMPLETE", Success, true),
    ("CREATE_IN_PROGRESS", InProgress, false),
    ("CREATE_FAILED", Failure, true),
    ("DELETE_COMPLETE", Success, true),
    ("DELETE_FAILED", Failure, true),
    ("DELETE_IN_PROGRESS", InProgress, false),
    ("DELETE_SKIPPED", Success, true),
    ("IMPORT_COMPLETE", Success, true),
    ("IMPORT_IN_PROGRESS", InProgress, false),
    ("IMPORT_ROLLBACK_COMPLETE", Failure, true),
    ("IMPORT_ROLLBACK_FAILED", Failure, true),
    ("IMPORT_ROLLBACK_IN_PROGRESS", InProgress, false),
    ("REVIEW_IN_PROGRESS", InProgress, false),
    ("ROLLBACK_COMPLETE", Failure, true),
    ("ROLLBACK_FAILED", Failure, true),
    ("ROLLBACK_IN_PROGRESS", InProgress, false),
    ("UPDATE_COMPLETE", Success, true),
    ("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS", InProgress, false),
    ("UPDATE_FAILED", Failure, true),
    ("UPDATE_IN_PROGRESS", InProgress, false),
    ("UPDATE_ROLLBACK_COMPLETE", Failure, true),
    ("UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS", InProgress, false),
    ("UPDATE_ROLLBACK_FAILED", Failure, true),
    ("UPDATE_ROLLBACK_IN_PROGRESS", InProgress, false),
];

pub fn classify(status: &str) -> StatusInfo {
    for (name, kind, is_final) in STATUS_TABLE {
        if *name == status {
            return StatusInfo {
                kind: *kind,
                is_final: *is_final,
            };
        }
    }
    StatusInfo {
        kind: InProgress,
        is_final: false,
    }
}

pub fn is_terminal(status: &str) -> bool {
    classify(status).is_final
}

pub fn is_success(status: &str) -> bool {
    classify(status).kind == Success
}

pub fn is_failure(status: &str) -> bool {
    classify(status).kind == Failure
}
