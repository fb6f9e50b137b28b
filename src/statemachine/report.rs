use std::sync::{Arc, Mutex};

use log::{error, info};

/// Receives step lifecycle events from the engine.
pub trait Reporter {
    fn step_started(&self, ordinal: usize, total: usize, name: &str);
    fn step_completed(&self, ordinal: usize, name: &str);
    fn step_failed(&self, ordinal: usize, name: &str, cause: &anyhow::Error);
}

/// Default reporter: everything goes through `log`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn step_started(&self, ordinal: usize, total: usize, name: &str) {
        info!("[{}/{}] {}", ordinal + 1, total, name);
    }

    fn step_completed(&self, _ordinal: usize, name: &str) {
        info!("{name} done");
    }

    fn step_failed(&self, _ordinal: usize, name: &str, cause: &anyhow::Error) {
        error!("{name} failed: {cause:#}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    Started(String),
    Completed(String),
    Failed(String),
}

/// Keeps every event in memory; clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<StepEvent>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Names of the steps that were started, in order.
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                StepEvent::Started(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: StepEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Reporter for RecordingReporter {
    fn step_started(&self, _ordinal: usize, _total: usize, name: &str) {
        self.push(StepEvent::Started(name.to_string()));
    }

    fn step_completed(&self, _ordinal: usize, name: &str) {
        self.push(StepEvent::Completed(name.to_string()));
    }

    fn step_failed(&self, _ordinal: usize, name: &str, _cause: &anyhow::Error) {
        self.push(StepEvent::Failed(name.to_string()));
    }
}
