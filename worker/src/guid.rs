//! Persistent job identifiers.

use uuid::Uuid;

const JOB_GUID_PREFIX: &str = "JOB_UUID1-";

/// New job GUID: a time-based (v1) UUID with a random node id.
///
/// Unique across hosts and sortable by creation time within one host.
pub fn generate_persistent_job_guid() -> String {
    let node_id: [u8; 6] = rand::random();
    format!("{JOB_GUID_PREFIX}{}", Uuid::now_v1(&node_id))
}
