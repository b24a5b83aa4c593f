//! Print statistics collaborator.
//!
//! The engine reports job lifecycle transitions here. Exactly one of
//! `note_complete`, `note_pause` or `note_error` follows each `note_start`,
//! with `note_cancel` added when a paused job is cancelled.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Oldest events are dropped past this many.
const EVENT_LOG_LEN: usize = 64;

pub trait PrintStats: Send + Sync {
    fn set_current_file(&self, name: &str);
    fn note_start(&self);
    fn note_pause(&self);
    fn note_complete(&self);
    fn note_error(&self, message: &str);
    fn note_cancel(&self);
    fn reset(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsEvent {
    SetFile(String),
    Start,
    Pause,
    Complete,
    Error(String),
    Cancel,
    Reset,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub filename: Option<String>,
    pub state: PrintState,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds spent printing, excluding pauses.
    pub print_duration: f64,
}

#[derive(Debug)]
struct Inner {
    snapshot: StatsSnapshot,
    resumed_at: Option<DateTime<Utc>>,
    events: VecDeque<StatsEvent>,
}

/// In-memory [`PrintStats`] that keeps timings and a bounded event log.
#[derive(Debug)]
pub struct PrintStatsTracker {
    inner: Mutex<Inner>,
}

impl Default for PrintStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PrintStatsTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot: StatsSnapshot {
                    filename: None,
                    state: PrintState::Standby,
                    message: None,
                    started_at: None,
                    finished_at: None,
                    print_duration: 0.0,
                },
                resumed_at: None,
                events: VecDeque::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> Option<StatsSnapshot> {
        self.inner.lock().ok().map(|inner| inner.snapshot.clone())
    }

    pub fn events(&self) -> Vec<StatsEvent> {
        self.inner
            .lock()
            .map(|inner| inner.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn update(&self, event: StatsEvent, apply: impl FnOnce(&mut Inner, DateTime<Utc>)) {
        if let Ok(mut inner) = self.inner.lock() {
            apply(&mut inner, Utc::now());
            tracing::debug!("print stats: {:?}", event);
            if inner.events.len() == EVENT_LOG_LEN {
                inner.events.pop_front();
            }
            inner.events.push_back(event);
        }
    }
}

fn accumulate(inner: &mut Inner, now: DateTime<Utc>) {
    if let Some(resumed) = inner.resumed_at.take() {
        let elapsed = (now - resumed).num_milliseconds().max(0) as f64 / 1000.0;
        inner.snapshot.print_duration += elapsed;
    }
}

impl PrintStats for PrintStatsTracker {
    fn set_current_file(&self, name: &str) {
        self.update(StatsEvent::SetFile(name.to_string()), |inner, _| {
            inner.snapshot.filename = Some(name.to_string());
        });
    }

    fn note_start(&self) {
        self.update(StatsEvent::Start, |inner, now| {
            if inner.snapshot.started_at.is_none() {
                inner.snapshot.started_at = Some(now);
            }
            inner.snapshot.state = PrintState::Printing;
            inner.snapshot.message = None;
            inner.resumed_at = Some(now);
        });
    }

    fn note_pause(&self) {
        self.update(StatsEvent::Pause, |inner, now| {
            accumulate(inner, now);
            inner.snapshot.state = PrintState::Paused;
        });
    }

    fn note_complete(&self) {
        self.update(StatsEvent::Complete, |inner, now| {
            accumulate(inner, now);
            inner.snapshot.state = PrintState::Complete;
            inner.snapshot.finished_at = Some(now);
        });
    }

    fn note_error(&self, message: &str) {
        self.update(StatsEvent::Error(message.to_string()), |inner, now| {
            accumulate(inner, now);
            inner.snapshot.state = PrintState::Error;
            inner.snapshot.message = Some(message.to_string());
            inner.snapshot.finished_at = Some(now);
        });
    }

    fn note_cancel(&self) {
        self.update(StatsEvent::Cancel, |inner, now| {
            accumulate(inner, now);
            inner.snapshot.state = PrintState::Cancelled;
            inner.snapshot.finished_at = Some(now);
        });
    }

    fn reset(&self) {
        self.update(StatsEvent::Reset, |inner, _| {
            inner.snapshot = StatsSnapshot {
                filename: None,
                state: PrintState::Standby,
                message: None,
                started_at: None,
                finished_at: None,
                print_duration: 0.0,
            };
            inner.resumed_at = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let stats = PrintStatsTracker::new();
        stats.set_current_file("cube.gcode");
        stats.note_start();
        stats.note_pause();
        stats.note_start();
        stats.note_complete();
        let snap = stats.snapshot().unwrap();
        assert_eq!(snap.state, PrintState::Complete);
        assert_eq!(snap.filename.as_deref(), Some("cube.gcode"));
        assert!(snap.started_at.is_some() && snap.finished_at.is_some());
        assert!(snap.print_duration >= 0.0);
        assert_eq!(stats.events().len(), 5);

        stats.reset();
        assert_eq!(stats.snapshot().unwrap().state, PrintState::Standby);
    }

    #[test]
    fn test_event_log_is_bounded() {
        let stats = PrintStatsTracker::new();
        for _ in 0..EVENT_LOG_LEN {
            stats.note_start();
        }
        stats.note_pause();
        let events = stats.events();
        assert_eq!(events.len(), EVENT_LOG_LEN);
        assert_eq!(events.last(), Some(&StatsEvent::Pause));
    }
}
