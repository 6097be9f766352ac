use tokio::sync::broadcast;

use crate::progress::{classify, Classified};

/// Event published on the orchestrator's single outbound stream
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A recognized progress marker for one file
    Progress { file: String, percent: u8 },
    /// An opaque log line, forwarded verbatim
    Log(String),
}

/// Single-publisher, many-subscriber event stream.
///
/// The orchestrator is the sole publisher; any number of clients may
/// subscribe. Events are not buffered or replayed for late subscribers, and
/// slow subscribers may observe lagged receives — that is the broadcast
/// contract the client signed up for.
#[derive(Debug)]
pub struct EventHub {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publish one line of output, classifying it first.
    ///
    /// Marker-shaped lines become `Progress` events; everything else is
    /// forwarded as a `Log` line. Send errors (no live subscriber) are
    /// ignored; processing never depends on anyone listening.
    pub fn publish_line(&self, line: &str) {
        let event = match classify(line) {
            Classified::Progress { file, percent } => PipelineEvent::Progress { file, percent },
            Classified::Log(text) => PipelineEvent::Log(text),
        };
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::marker;

    #[tokio::test]
    async fn test_publish_classifies_lines() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe();

        hub.publish_line(&marker("clip.mp4", 30));
        hub.publish_line("[ffmpeg] opening decoder");

        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::Progress {
                file: "clip.mp4".to_string(),
                percent: 30,
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::Log("[ffmpeg] opening decoder".to_string())
        );
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_every_event() {
        let hub = EventHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.publish_line("one");
        assert_eq!(a.recv().await.unwrap(), PipelineEvent::Log("one".into()));
        assert_eq!(b.recv().await.unwrap(), PipelineEvent::Log("one".into()));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let hub = EventHub::new(16);
        hub.publish_line("nobody is listening");
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let hub = EventHub::new(16);
        hub.publish_line("before subscribe");

        let mut rx = hub.subscribe();
        hub.publish_line("after subscribe");
        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::Log("after subscribe".to_string())
        );
    }
}
