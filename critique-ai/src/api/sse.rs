//! Server-Sent Events (SSE) for pipeline progress
//!
//! GET /events streams every [`CritiqueEvent`]; `?job_id=` narrows the
//! stream to one job or group job.

use crate::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use critique_common::events::CritiqueEvent;
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub job_id: Option<Uuid>,
}

impl EventFilter {
    fn matches(&self, event: &CritiqueEvent) -> bool {
        match self.job_id {
            None => true,
            Some(id) => event.job_id() == Some(id),
        }
    }
}

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(job_id = ?filter.job_id, "New SSE client connected");

    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !filter.matches(&event) {
                        continue;
                    }
                    let event_type = event.event_type();
                    match serde_json::to_string(&event) {
                        Ok(event_json) => {
                            debug!("SSE: Broadcasting event: {}", event_type);
                            yield Ok(Event::default().event(event_type).data(event_json));
                        }
                        Err(e) => {
                            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE: Client lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use critique_common::events::JobKind;

    fn cancelled(job_id: Uuid) -> CritiqueEvent {
        CritiqueEvent::JobCancelled {
            job_id,
            job_kind: JobKind::Single,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_unfiltered_stream_passes_everything() {
        let filter = EventFilter::default();
        assert!(filter.matches(&cancelled(Uuid::new_v4())));
        assert!(filter.matches(&CritiqueEvent::EventsPurged {
            deleted: 3,
            retention_days: 60,
            timestamp: Utc::now(),
        }));
    }

    #[test]
    fn test_job_filter_drops_other_jobs_and_global_events() {
        let watched = Uuid::new_v4();
        let filter = EventFilter {
            job_id: Some(watched),
        };
        assert!(filter.matches(&cancelled(watched)));
        assert!(!filter.matches(&cancelled(Uuid::new_v4())));
        assert!(!filter.matches(&CritiqueEvent::EventsPurged {
            deleted: 0,
            retention_days: 60,
            timestamp: Utc::now(),
        }));
    }
}
