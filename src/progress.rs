//! Multi-reader progress reporting for task start-up.
//!
//! A single producer appends [`ProgressEvent`]s to a shared log; any number
//! of subscribers replay the identical ordered history from the first event,
//! suspending at the tail until the producer appends more or closes the
//! stream. This is what lets a progress endpoint be polled by several
//! independent readers without losing early events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

/// One step of task start-up progress.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Completion percentage in `0.0..=100.0`.
    pub progress: f64,
    /// Optional human-readable description of the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    /// Creates an event with no message.
    #[must_use]
    pub const fn at(progress: f64) -> Self {
        Self {
            progress,
            message: None,
        }
    }

    /// Creates an event carrying a message.
    #[must_use]
    pub fn with_message(progress: f64, message: impl Into<String>) -> Self {
        Self {
            progress,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Default)]
struct EventLog {
    events: Vec<ProgressEvent>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    log: Mutex<EventLog>,
    // Bumped on every append or close; receivers re-read the log on wake-up.
    wakeup: watch::Sender<u64>,
}

/// Append-only broadcast log of progress events.
///
/// Cloning shares the underlying log. Unlike a plain broadcast channel,
/// [`ProgressBroadcaster::subscribe`] hands out an independent cursor per
/// reader, so a late subscriber still observes every event from the
/// beginning.
#[derive(Clone, Debug)]
pub struct ProgressBroadcaster {
    shared: Arc<Shared>,
}

impl ProgressBroadcaster {
    /// Creates an empty, open log.
    #[must_use]
    pub fn new() -> Self {
        let (wakeup, _initial) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                log: Mutex::new(EventLog::default()),
                wakeup,
            }),
        }
    }

    /// Appends an event. Writes after [`ProgressBroadcaster::close`] are
    /// ignored.
    pub fn write(&self, event: ProgressEvent) {
        let mut log = lock(&self.shared.log);
        if log.closed {
            return;
        }
        log.events.push(event);
        drop(log);
        self.shared.wakeup.send_modify(|version| *version += 1);
    }

    /// Closes the log; every subscriber terminates once it has replayed the
    /// full history.
    pub fn close(&self) {
        let mut log = lock(&self.shared.log);
        log.closed = true;
        drop(log);
        self.shared.wakeup.send_modify(|version| *version += 1);
    }

    /// Creates a reader that replays the log from the first event.
    #[must_use]
    pub fn subscribe(&self) -> ProgressStream {
        ProgressStream {
            shared: Arc::clone(&self.shared),
            wakeup: self.shared.wakeup.subscribe(),
            cursor: 0,
        }
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Independent cursor over a [`ProgressBroadcaster`] log.
#[derive(Debug)]
pub struct ProgressStream {
    shared: Arc<Shared>,
    wakeup: watch::Receiver<u64>,
    cursor: usize,
}

impl ProgressStream {
    /// Yields the next event, waiting for the producer when the reader has
    /// caught up. Returns `None` once the log is closed and fully replayed.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            {
                let log = lock(&self.shared.log);
                if let Some(event) = log.events.get(self.cursor) {
                    self.cursor += 1;
                    return Some(event.clone());
                }
                if log.closed {
                    return None;
                }
            }
            // The sender lives inside the shared state this stream holds, so
            // an error here means the log was torn down entirely.
            if self.wakeup.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Drains the remaining events until the log closes.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

fn lock(log: &Mutex<EventLog>) -> MutexGuard<'_, EventLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn event(progress: f64) -> ProgressEvent {
        ProgressEvent::at(progress)
    }

    #[tokio::test]
    async fn late_subscriber_sees_full_history() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.write(event(0.5));
        broadcaster.write(event(1.0));

        let early = broadcaster.subscribe();
        broadcaster.write(event(2.0));
        let late = broadcaster.subscribe();
        broadcaster.close();

        let early_events = early.collect().await;
        let late_events = late.collect().await;
        assert_eq!(early_events, late_events);
        assert_eq!(
            early_events,
            vec![event(0.5), event(1.0), event(2.0)],
            "subscribers must replay from the first event"
        );
    }

    #[tokio::test]
    async fn reader_resumes_when_producer_appends() {
        let broadcaster = ProgressBroadcaster::new();
        let mut stream = broadcaster.subscribe();

        let producer = broadcaster.clone();
        let reader = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        producer.write(event(42.0));

        let received = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap_or_else(|err| panic!("reader timed out: {err}"))
            .unwrap_or_else(|err| panic!("reader panicked: {err}"));
        assert_eq!(received, Some(event(42.0)));
    }

    #[tokio::test]
    async fn close_terminates_pending_readers() {
        let broadcaster = ProgressBroadcaster::new();
        let mut stream = broadcaster.subscribe();

        let producer = broadcaster.clone();
        let reader = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        producer.close();

        let received = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap_or_else(|err| panic!("reader timed out: {err}"))
            .unwrap_or_else(|err| panic!("reader panicked: {err}"));
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn writes_after_close_are_ignored() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.write(event(1.0));
        broadcaster.close();
        broadcaster.write(event(2.0));

        let events = broadcaster.subscribe().collect().await;
        assert_eq!(events, vec![event(1.0)]);
    }

    #[tokio::test]
    async fn message_is_preserved_in_order() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.write(ProgressEvent::with_message(100.0, "Server started"));
        broadcaster.close();

        let events = broadcaster.subscribe().collect().await;
        assert_eq!(
            events,
            vec![ProgressEvent::with_message(100.0, "Server started")]
        );
    }
}
