//! Push handler - offers incoming records to the repository.

use crate::db::{PushOutcome, RecordRepository};
use crate::error::{AppError, Result};
use cairn_engine::{PushRequest, PushResponse, RejectedRecord};

/// Process a push request from a client.
///
/// Malformed records are rejected individually; the rest of the batch is
/// still applied.
pub fn handle_push(
    repo: &RecordRepository,
    request: PushRequest,
    max_batch_size: usize,
) -> Result<PushResponse> {
    if request.records.len() > max_batch_size {
        return Err(AppError::BadRequest(format!(
            "batch of {} records exceeds the limit of {}",
            request.records.len(),
            max_batch_size
        )));
    }

    let mut response = PushResponse::accepted();
    let mut accepted = 0usize;

    for pushed in request.records {
        if let Some(reason) = invalid(&pushed.store, &pushed.record.id) {
            tracing::warn!(store = %pushed.store, id = %pushed.record.id, reason, "record rejected");
            response.rejected.push(RejectedRecord {
                record_id: pushed.record.id,
                store: Some(pushed.store),
                reason: reason.to_string(),
            });
            continue;
        }

        match repo.offer(pushed) {
            PushOutcome::Accepted => accepted += 1,
            PushOutcome::Conflict(conflict) => response.conflicts.push(conflict),
        }
    }

    tracing::info!(
        accepted,
        conflicts = response.conflicts.len(),
        rejected = response.rejected.len(),
        "push processed"
    );
    Ok(response)
}

fn invalid(store: &str, id: &str) -> Option<&'static str> {
    if store.is_empty() {
        Some("missing store name")
    } else if id.is_empty() {
        Some("missing record id")
    } else {
        None
    }
}
