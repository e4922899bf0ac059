use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use cm_api_types::{ErrorResponse, TxResponse};
use cm_market_core::{MarketAction, MarketActions, Submission, SubmissionId, status_message};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::{ApiError, ApiResult, AppState};

const RETAINED_SUBMISSIONS: usize = 256;

/// One user action and the submission its transactions report into.
#[derive(Clone)]
pub(crate) struct TrackedAction {
    pub(crate) action: MarketAction,
    pub(crate) submission: Submission,
    pub(crate) actions: MarketActions,
}

impl TrackedAction {
    pub(crate) fn response(&self) -> TxResponse {
        let status = self.submission.status();
        TxResponse {
            submission_id: Some(self.submission.id().0),
            message: status_message(self.action, &status),
            status,
        }
    }
}

/// Recent submissions by id. The oldest are dropped once the log is full.
#[derive(Default)]
pub(crate) struct SubmissionLog {
    entries: Mutex<BTreeMap<SubmissionId, TrackedAction>>,
}

impl SubmissionLog {
    pub(crate) fn record(&self, tracked: TrackedAction) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(tracked.submission.id(), tracked);
        while entries.len() > RETAINED_SUBMISSIONS {
            entries.pop_first();
        }
    }

    pub(crate) fn forget(&self, id: SubmissionId) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }

    fn get(&self, id: SubmissionId) -> Option<TrackedAction> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn latest(&self) -> Option<TrackedAction> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_key_value()
            .map(|(_, tracked)| tracked.clone())
    }
}

/// The most recently started submission.
pub(crate) async fn latest(State(state): State<AppState>) -> Json<TxResponse> {
    Json(
        state
            .submissions
            .latest()
            .map(|tracked| tracked.response())
            .unwrap_or_default(),
    )
}

pub(crate) async fn by_id(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<TxResponse> {
    state
        .submissions
        .get(SubmissionId(id))
        .map(|tracked| Json(tracked.response()))
        .ok_or_else(|| unknown_submission(id))
}

fn unknown_submission(id: u64) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("no submission with id {id}"),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_api_types::TxStatus;
    use cm_market_core::TransactionSubmitter;
    use std::sync::Arc;

    fn tracked(actions: &MarketActions, action: MarketAction) -> TrackedAction {
        let submission = actions.submitter().begin();
        TrackedAction {
            action,
            actions: actions.tracked(&submission),
            submission,
        }
    }

    #[test]
    fn log_keeps_the_most_recent_submissions() {
        let actions = MarketActions::new(Arc::new(TransactionSubmitter::new()));
        let log = SubmissionLog::default();
        let first = tracked(&actions, MarketAction::Mint);
        let first_id = first.submission.id();
        log.record(first);
        for _ in 0..RETAINED_SUBMISSIONS {
            log.record(tracked(&actions, MarketAction::Withdraw));
        }

        assert!(log.get(first_id).is_none());
        let latest = log.latest().expect("recorded");
        assert_eq!(latest.submission.id(), SubmissionId(RETAINED_SUBMISSIONS as u64 + 1));
        assert_eq!(latest.response().status, TxStatus::Idle);
        assert_eq!(latest.response().message, "");
    }
}
