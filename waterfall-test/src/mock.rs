use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use waterfall_core::payload::{EventTransaction, Span};
use waterfall_core::{ApiError, TraceApiClient};

/// In-memory [`TraceApiClient`] keyed by `{project_slug}:{event_id}`.
/// Unknown keys answer with `ApiError::NotFound`.
#[derive(Default)]
pub struct MockApiClient {
    responses: Mutex<HashMap<String, Result<EventTransaction, ApiError>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl MockApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every response back by `delay` so callers can race requests.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn respond(&self, project_slug: &str, event_id: &str, spans: Vec<Span>) {
        self.responses.lock().unwrap().insert(
            key(project_slug, event_id),
            Ok(EventTransaction::with_spans(spans)),
        );
    }

    pub fn fail(&self, project_slug: &str, event_id: &str, error: ApiError) {
        self.responses
            .lock()
            .unwrap()
            .insert(key(project_slug, event_id), Err(error));
    }

    pub fn calls(&self, project_slug: &str, event_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&key(project_slug, event_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

fn key(project_slug: &str, event_id: &str) -> String {
    format!("{}:{}", project_slug, event_id)
}

#[async_trait]
impl TraceApiClient for MockApiClient {
    async fn fetch_event(&self, project_slug: &str, event_id: &str) -> Result<EventTransaction, ApiError> {
        let key = key(project_slug, event_id);
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let response = self.responses.lock().unwrap().get(&key).cloned();
        response.unwrap_or(Err(ApiError::NotFound(key)))
    }
}
