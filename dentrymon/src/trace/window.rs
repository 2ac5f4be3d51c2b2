//! Bounded in-memory window of recent enriched trace events, backing the
//! HTTP query surface. The rotated TSV files remain the durable record;
//! this buffer only answers "what allocated in the last few minutes"
//! without touching disk.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use super::TraceEvent;

/// Query filter for the window. All fields are conjunctive; unset fields
/// match everything.
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub pod: Option<String>,
    pub container: Option<String>,
    /// Substring match against the reconstructed path.
    pub path: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of events returned, newest first.
    pub limit: usize,
}

pub struct TraceWindow {
    capacity: usize,
    events: Mutex<VecDeque<Arc<TraceEvent>>>,
}

impl TraceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an event, evicting the oldest once full.
    pub fn push(&self, event: Arc<TraceEvent>) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Newest-first filtered view of the window.
    pub fn query(&self, filter: &EventFilter) -> Vec<Arc<TraceEvent>> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };

        events
            .iter()
            .rev()
            .filter(|e| matches(e, filter))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches(event: &TraceEvent, filter: &EventFilter) -> bool {
    if let Some(pod) = &filter.pod {
        if &event.pod != pod {
            return false;
        }
    }
    if let Some(container) = &filter.container {
        if &event.container != container {
            return false;
        }
    }
    if let Some(path) = &filter.path {
        if !event.path.contains(path.as_str()) {
            return false;
        }
    }
    if let Some(since) = &filter.since {
        if event.timestamp < *since {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(pod: &str, path: &str, ts_secs: i64) -> Arc<TraceEvent> {
        Arc::new(TraceEvent {
            timestamp: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            pod: pod.to_string(),
            container: "c0".to_string(),
            cgroup_id: 1,
            operation: "alloc",
            path: path.to_string(),
            fstype: "ext4".to_string(),
        })
    }

    #[test]
    fn window_evicts_oldest_at_capacity() {
        let window = TraceWindow::new(2);
        window.push(event("a", "/1", 1));
        window.push(event("b", "/2", 2));
        window.push(event("c", "/3", 3));

        assert_eq!(window.len(), 2);
        let all = window.query(&EventFilter::default());
        let pods: Vec<&str> = all.iter().map(|e| e.pod.as_str()).collect();
        assert_eq!(pods, vec!["c", "b"]);
    }

    #[test]
    fn query_is_newest_first_and_limited() {
        let window = TraceWindow::new(10);
        for i in 0..5 {
            window.push(event("p", &format!("/f{i}"), i));
        }
        let filter = EventFilter {
            limit: 2,
            ..Default::default()
        };
        let got = window.query(&filter);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].path, "/f4");
        assert_eq!(got[1].path, "/f3");
    }

    #[test]
    fn filters_are_conjunctive() {
        let window = TraceWindow::new(10);
        window.push(event("web", "/var/lib/mysql/foo.ibd", 10));
        window.push(event("web", "/tmp/scratch", 11));
        window.push(event("db", "/var/lib/mysql/bar.ibd", 12));

        let filter = EventFilter {
            pod: Some("web".to_string()),
            path: Some(".ibd".to_string()),
            ..Default::default()
        };
        let got = window.query(&filter);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].path, "/var/lib/mysql/foo.ibd");
    }

    #[test]
    fn since_excludes_older_events() {
        let window = TraceWindow::new(10);
        window.push(event("p", "/old", 100));
        window.push(event("p", "/new", 200));

        let filter = EventFilter {
            since: Some(Utc.timestamp_opt(150, 0).unwrap()),
            ..Default::default()
        };
        let got = window.query(&filter);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].path, "/new");
    }
}
