use sha2::{Digest, Sha256};

use crate::status;

/// Reasons that carry no new diagnostic information: the placeholder
/// dash, cancellation noise, and the aggregate cascade message.
const CANCELLED_REASON: &str = "Resource creation cancelled";
const CASCADE_REASON_FRAGMENT: &str = "The following resource(s) failed to";

/// One stack lifecycle event as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEvent {
    pub resource_logical_id: String,
    pub resource_type: String,
    pub resource_status: String,
    pub resource_status_reason: Option<String>,
    /// Event timestamp, epoch milliseconds.
    pub timestamp_ms: i64,
}

impl StackEvent {
    /// Content hash over the full event payload. Two structurally
    /// identical events collide, which is the deduplication key across
    /// polls.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.resource_logical_id.as_bytes());
        hasher.update(self.resource_type.as_bytes());
        hasher.update(self.resource_status.as_bytes());
        hasher.update(self.resource_status_reason.as_deref().unwrap_or("").as_bytes());
        hasher.update(self.timestamp_ms.to_be_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Whether this event should be surfaced to the caller: a failure
    /// status, newer than the deployment start, with a reason that says
    /// something a human can act on.
    pub fn is_reportable(&self, deployment_start_ms: i64) -> bool {
        if self.timestamp_ms <= deployment_start_ms {
            return false;
        }
        if !status::is_failure(&self.resource_status) {
            return false;
        }
        let reason = match self.resource_status_reason.as_deref() {
            Some(reason) if !reason.is_empty() => reason,
            _ => return false,
        };
        if reason == "-" || reason == CANCELLED_REASON {
            return false;
        }
        if reason.contains(CASCADE_REASON_FRAGMENT) {
            return false;
        }
        true
    }
}
