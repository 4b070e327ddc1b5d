//! Pool-assigned share difficulty for one session.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::Difficulty;

/// Tracks the pool target and the one-shot warm-up suggestion
#[derive(Debug, Clone)]
pub struct DifficultyController {
    /// Last difficulty mandated by the pool
    current: Difficulty,

    /// Whether the pool has sent mining.set_difficulty yet
    assigned: bool,

    /// Difficulty to suggest after warm-up
    suggestion: Option<Difficulty>,

    warmup: Duration,

    /// When the suggestion becomes due (set once authorized)
    suggest_at: Option<Instant>,

    suggested: bool,
}

impl DifficultyController {
    pub fn new(suggestion: Option<f64>, warmup: Duration) -> Self {
        Self {
            current: Difficulty::default(),
            assigned: false,
            suggestion: suggestion.and_then(|d| Difficulty::new(d).ok()),
            warmup,
            suggest_at: None,
            suggested: false,
        }
    }

    /// Apply mining.set_difficulty. Takes effect immediately.
    pub fn apply(&mut self, difficulty: Difficulty) -> Difficulty {
        let previous = self.current;
        self.current = difficulty;
        self.assigned = true;
        debug!(from = %previous, to = %difficulty, "Pool difficulty updated");
        previous
    }

    pub fn current(&self) -> Difficulty {
        self.current
    }

    pub fn target_hex(&self) -> String {
        self.current.target_hex()
    }

    /// Arm the warm-up timer. Only the first authorization counts.
    pub fn on_authorized(&mut self, now: Instant) {
        if self.suggestion.is_some() && !self.suggested && self.suggest_at.is_none() {
            self.suggest_at = Some(now + self.warmup);
        }
    }

    /// Deadline of the pending suggestion, if any
    pub fn suggestion_due(&self) -> Option<Instant> {
        self.suggest_at
    }

    /// Consume the suggestion.
    ///
    /// Returns `None` when the pool already mandates a difficulty at or above
    /// the suggestion, so a suggestion never asks for less than the pool minimum.
    pub fn take_suggestion(&mut self) -> Option<Difficulty> {
        self.suggest_at = None;
        if self.suggested {
            return None;
        }
        self.suggested = true;

        let suggestion = self.suggestion?;
        if self.assigned && suggestion.value() <= self.current.value() {
            debug!(
                suggestion = %suggestion,
                current = %self.current,
                "Skipping difficulty suggestion below pool minimum"
            );
            return None;
        }
        Some(suggestion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_updates_target_immediately() {
        let mut controller = DifficultyController::new(None, Duration::from_secs(5));
        assert_eq!(controller.current(), Difficulty(1.0));

        let previous = controller.apply(Difficulty(4.0));
        assert_eq!(previous, Difficulty(1.0));
        assert_eq!(controller.current(), Difficulty(4.0));
        assert!(controller.target_hex().starts_with("000000003fffc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggestion_fires_once_after_warmup() {
        let mut controller = DifficultyController::new(Some(64.0), Duration::from_secs(5));
        assert!(controller.suggestion_due().is_none());

        let now = Instant::now();
        controller.on_authorized(now);
        assert_eq!(controller.suggestion_due(), Some(now + Duration::from_secs(5)));

        assert_eq!(controller.take_suggestion(), Some(Difficulty(64.0)));
        assert!(controller.suggestion_due().is_none());

        // Re-authorization never re-arms it
        controller.on_authorized(Instant::now());
        assert!(controller.suggestion_due().is_none());
        assert_eq!(controller.take_suggestion(), None);
    }

    #[test]
    fn test_suggestion_never_below_pool_minimum() {
        let mut controller = DifficultyController::new(Some(8.0), Duration::from_secs(1));
        controller.apply(Difficulty(16.0));
        controller.on_authorized(Instant::now());
        assert_eq!(controller.take_suggestion(), None);
    }
}
