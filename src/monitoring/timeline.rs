//! Execution Timeline
//!
//! Records engine events with their arrival time for trace reports and
//! per-transition firing statistics.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::execution::event::EngineEvent;
use crate::execution::token::TokenId;

/// Type of timeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceKind {
    /// A transition fired
    Triggered,
    /// An external activity was handed a token
    ActivityStarted { activity: String },
    /// A terminal place was reached
    Completed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Transition path, or the terminal place for completions
    pub subject: String,
    pub kind: TraceKind,
    pub token: Option<TokenId>,
    pub timestamp: Instant,
}

/// Tracks the events of a workplan run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TraceEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an engine event.
    pub fn record(&mut self, event: &EngineEvent) {
        let (subject, kind, token) = match event {
            EngineEvent::TransitionTriggered { transition } => (transition.to_string(), TraceKind::Triggered, None),
            EngineEvent::ActivityStarted {
                transition,
                activity,
                token,
            } => (
                transition.to_string(),
                TraceKind::ActivityStarted {
                    activity: activity.clone(),
                },
                Some(token.id()),
            ),
            EngineEvent::Completed { place, token } => (place.clone(), TraceKind::Completed, Some(token.id())),
        };

        self.events.push(TraceEvent {
            subject,
            kind,
            token,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of firings per transition path.
    pub fn trigger_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for event in self.events.iter().filter(|e| e.kind == TraceKind::Triggered) {
            *counts.entry(event.subject.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn triggered(&self) -> usize {
        self.events.iter().filter(|e| e.kind == TraceKind::Triggered).count()
    }

    /// Generates a plain-text trace, one line per event.
    pub fn trace_report(&self) -> String {
        let mut output = String::from("\nExecution Trace:\n\n");

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time).as_millis();
            let detail = match &event.kind {
                TraceKind::Triggered => "fired".to_string(),
                TraceKind::ActivityStarted { activity } => format!("awaits '{}'", activity),
                TraceKind::Completed => "completed".to_string(),
            };
            let token = event
                .token
                .map(|id| format!(" [{}]", short_id(&id)))
                .unwrap_or_default();

            output.push_str(&format!(
                "{:>6} ms  {} {}{}\n",
                offset,
                truncate(&event.subject, 28),
                detail,
                token
            ));
        }

        output.push_str(&format!(
            "\nTotal: {} events, {} firings, {} ms\n",
            self.events.len(),
            self.triggered(),
            self.elapsed().as_millis()
        ));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn short_id(id: &TokenId) -> String {
    id.to_string().chars().take(8).collect()
}

/// Pads or truncates a string to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
