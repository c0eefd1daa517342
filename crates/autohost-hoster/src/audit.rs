use autohost_instance::InstanceId;
use rand::{Rng, distributions::Alphanumeric};

use crate::collaborators::Storage;

const EVENT_CODE_LEN: usize = 14;

pub fn event_code() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(EVENT_CODE_LEN)
        .map(char::from)
        .collect();
    format!("A-{suffix}")
}

/// Appends an audited action to the event log and returns its code.
///
/// The code is handed to the player even when the insert failed, so a
/// failure only costs traceability.
pub async fn log_action(storage: &dyn Storage, instance: InstanceId, tag: &str, msg: &str) -> String {
    let code = event_code();
    let line = format!("{code} {instance} [{tag}] {msg}");
    if let Err(err) = storage.log_event(&line).await {
        tracing::warn!(%err, %instance, tag, "failed to write event log entry");
    }
    code
}
