use std::sync::Arc;

use shared::domain::Origin;
use tracing::{info, warn};

use crate::{
    api::ChatApi,
    error::{HistoryLoadError, ValidationError},
    message::Message,
    session::Session,
};

/// Messages returned by one history fetch, in server order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySnapshot {
    pub messages: Vec<Message>,
    /// Records that were skipped because they could not form a message.
    pub rejected: Vec<ValidationError>,
}

#[derive(Clone)]
pub struct HistoryLoader {
    api: Arc<dyn ChatApi>,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    /// One request, no retry. A response that is not a list fails the load;
    /// individual malformed records are skipped.
    pub async fn load(&self, session: &Session) -> Result<HistorySnapshot, HistoryLoadError> {
        let records = self.api.fetch_history(session.token()).await?;

        let mut snapshot = HistorySnapshot::default();
        for record in records {
            match Message::from_record(record, Origin::History) {
                Ok(message) => snapshot.messages.push(message),
                Err(err) => {
                    warn!(error = %err, "history: skipping malformed record");
                    snapshot.rejected.push(err);
                }
            }
        }

        info!(
            loaded = snapshot.messages.len(),
            skipped = snapshot.rejected.len(),
            "history: loaded snapshot"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
