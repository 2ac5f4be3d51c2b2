//! HTTP query surface over the in-memory trace window plus runtime trace
//! configuration. The TSV files are the durable output; these endpoints
//! exist for interactive debugging against a live node.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::window::{EventFilter, TraceWindow};
use super::{TraceControl, TraceEvent};

const DEFAULT_QUERY_LIMIT: usize = 100;

#[derive(Clone)]
pub struct TraceApi {
    pub window: Arc<TraceWindow>,
    pub control: Arc<TraceControl>,
}

#[derive(Debug, Deserialize)]
struct TraceQuery {
    pod: Option<String>,
    container: Option<String>,
    path: Option<String>,
    /// RFC3339 lower bound on event time.
    since: Option<String>,
    limit: Option<usize>,
}

/// Wire form of the tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<String>,
}

pub fn router(api: TraceApi) -> Router {
    Router::new()
        .route("/traces", get(list_traces))
        .route("/traces/config", get(get_config).put(put_config))
        .with_state(api)
}

async fn list_traces(State(api): State<TraceApi>, Query(q): Query<TraceQuery>) -> Response {
    let mut filter = EventFilter {
        pod: q.pod,
        container: q.container,
        path: q.path,
        since: None,
        limit: q.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
    };

    if let Some(since) = q.since {
        match DateTime::parse_from_rfc3339(&since) {
            Ok(t) => filter.since = Some(t.with_timezone(&Utc)),
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "invalid since timestamp").into_response();
            }
        }
    }

    let events: Vec<TraceEvent> = api
        .window
        .query(&filter)
        .iter()
        .map(|e| (**e).clone())
        .collect();
    Json(events).into_response()
}

async fn get_config(State(api): State<TraceApi>) -> Json<TraceSettings> {
    Json(TraceSettings {
        enabled: api.control.enabled(),
        patterns: api.control.patterns(),
    })
}

async fn put_config(
    State(api): State<TraceApi>,
    Json(settings): Json<TraceSettings>,
) -> Response {
    if let Err(e) = api.control.set_enabled(settings.enabled) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to update trace config: {e:#}"),
        )
            .into_response();
    }
    api.control.set_patterns(settings.patterns.clone());
    Json(settings).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_as_json() {
        let settings = TraceSettings {
            enabled: true,
            patterns: vec![".ibd".to_string()],
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: TraceSettings = serde_json::from_str(&json).unwrap();
        assert!(back.enabled);
        assert_eq!(back.patterns, vec![".ibd"]);
    }

    #[test]
    fn patterns_default_to_empty() {
        let back: TraceSettings = serde_json::from_str(r#"{"enabled":false}"#).unwrap();
        assert!(!back.enabled);
        assert!(back.patterns.is_empty());
    }

    #[test]
    fn events_serialize_with_rfc3339_timestamps() {
        let event = TraceEvent {
            timestamp: Utc::now(),
            pod: "pod-1234".to_string(),
            container: String::new(),
            cgroup_id: 7,
            operation: "alloc",
            path: "/tmp/x".to_string(),
            fstype: "tmpfs".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"operation\":\"alloc\""));
        assert!(json.contains("\"cgroup_id\":7"));
    }
}
