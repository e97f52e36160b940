use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use tradesync_core::*;

/// Holds at most one status message and hides it after `ttl`.
///
/// A newer message replaces the current one and restarts the timer.
#[derive(Debug)]
pub struct StatusNotifier {
    ttl: Duration,
    current: Option<(StatusMessage, Instant)>,
}

impl StatusNotifier {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, current: None }
    }

    pub fn notify(&mut self, text: impl Into<String>, severity: Severity, now: Instant) {
        let message = StatusMessage::new(text, severity);
        debug!(severity = ?severity, text = %message.text, "Status message");
        self.current = Some((message, now + self.ttl));
    }

    /// The message on display at `now`, if any.
    pub fn visible(&self, now: Instant) -> Option<&StatusMessage> {
        self.current
            .as_ref()
            .filter(|(_, hide_at)| now < *hide_at)
            .map(|(message, _)| message)
    }

    /// Drop the message once its time is up. Returns true if one was cleared.
    pub fn expire(&mut self, now: Instant) -> bool {
        match &self.current {
            Some((_, hide_at)) if now >= *hide_at => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|(_, hide_at)| *hide_at)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_message_wins() {
        let mut notifier = StatusNotifier::new(Duration::from_secs(3));
        let start = Instant::now();
        notifier.notify("first", Severity::Success, start);
        notifier.notify("second", Severity::Error, start + Duration::from_secs(1));

        let shown = notifier.visible(start + Duration::from_secs(2)).unwrap();
        assert_eq!(shown.text, "second");
        assert_eq!(shown.color, "#EF4444");
    }

    #[test]
    fn test_hidden_three_seconds_after_last_notify() {
        let mut notifier = StatusNotifier::new(Duration::from_secs(3));
        let start = Instant::now();
        notifier.notify("first", Severity::Success, start);
        notifier.notify("second", Severity::Success, start + Duration::from_secs(2));

        // The first message's timer no longer applies.
        assert!(notifier.visible(start + Duration::from_secs(4)).is_some());
        assert!(!notifier.expire(start + Duration::from_secs(4)));

        let hide_at = start + Duration::from_secs(5);
        assert_eq!(notifier.deadline(), Some(hide_at));
        assert!(notifier.visible(hide_at).is_none());
        assert!(notifier.expire(hide_at));
        assert_eq!(notifier.deadline(), None);
    }
}
