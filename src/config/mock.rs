//! Mock config source for testing
//!
//! Replays a scripted sequence of fetch outcomes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ConfigSource, FetchOutcome};

/// Mock config source
///
/// # Example
/// ```
/// use slurm_node_setup::config::FetchOutcome;
/// use slurm_node_setup::config::mock::MockSource;
///
/// let source = MockSource::new(vec![FetchOutcome::NotReady("empty bucket".into())]);
/// assert_eq!(source.calls(), 0);
/// ```
pub struct MockSource {
    outcomes: Mutex<VecDeque<FetchOutcome>>,
    calls: AtomicUsize,
}

impl MockSource {
    /// Outcomes are returned in order; the last one repeats forever
    pub fn new(outcomes: Vec<FetchOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of fetches performed so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for MockSource {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn fetch(&self) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = match self.outcomes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if outcomes.len() > 1 {
            outcomes
                .pop_front()
                .unwrap_or_else(|| FetchOutcome::Fatal("no outcome scripted".to_string()))
        } else {
            outcomes
                .front()
                .cloned()
                .unwrap_or_else(|| FetchOutcome::Fatal("no outcome scripted".to_string()))
        }
    }
}
