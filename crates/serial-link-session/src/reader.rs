//! Framed read loop.
//!
//! Decodes raw chunks to text, splits the text into `<...>` frames and hands
//! each frame to a [`FrameSink`], acknowledging it before reading on.

use async_trait::async_trait;
use serial_link_core::{ACK_BYTE, FrameReader, PortReader, SerialMessage, TextDecoder};
use tokio_util::sync::CancellationToken;

/// Receiver of completed frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Hand a completed frame to subscribers.
    fn deliver(&self, message: &SerialMessage);

    /// Write the acknowledgment for the frame just delivered.
    async fn acknowledge(&self, ack: &[u8]) -> bool;
}

/// Why a read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The stream signalled end of data.
    Ended,
    /// The loop was cancelled from outside.
    Cancelled,
    /// The transport reported an error.
    Failed,
}

/// Read frames until the stream ends, the token is cancelled or the
/// transport fails.
///
/// Transport errors are logged, not returned. The reader is dropped on
/// every exit path, releasing the port's read lock.
pub async fn run_read_loop<S>(
    mut reader: Box<dyn PortReader>,
    sink: &S,
    cancel: &CancellationToken,
) -> ReadOutcome
where
    S: FrameSink + ?Sized,
{
    let mut decoder = TextDecoder::new();
    let mut frames = FrameReader::new();

    let outcome = loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => break ReadOutcome::Cancelled,
            chunk = reader.read_chunk() => chunk,
        };

        match chunk {
            Ok(Some(bytes)) => {
                let text = decoder.decode(&bytes);
                if !process_text(&text, &mut frames, sink, cancel).await {
                    break ReadOutcome::Cancelled;
                }
            }
            Ok(None) => {
                let tail = decoder.finish();
                if !process_text(&tail, &mut frames, sink, cancel).await {
                    break ReadOutcome::Cancelled;
                }
                break ReadOutcome::Ended;
            }
            Err(e) => {
                tracing::error!("Serial read failed: {e}");
                break ReadOutcome::Failed;
            }
        }
    };

    drop(reader);
    outcome
}

/// Frame `text` and hand completed frames to `sink`.
///
/// Returns false if cancellation stopped it before the end of `text`; no
/// frame is delivered once the token is cancelled.
async fn process_text<S>(
    text: &str,
    frames: &mut FrameReader,
    sink: &S,
    cancel: &CancellationToken,
) -> bool
where
    S: FrameSink + ?Sized,
{
    for c in text.chars() {
        let Some(value) = frames.push(c) else {
            continue;
        };
        if cancel.is_cancelled() {
            return false;
        }

        let message = SerialMessage::now(value);
        tracing::debug!(len = message.value.len(), "Frame received");
        sink.deliver(&message);

        if !sink.acknowledge(&[ACK_BYTE]).await {
            tracing::debug!("Frame acknowledgment not written");
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use serial_link_core::TransportError;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Delivered(String),
        Ack(Vec<u8>),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
        cancel_on_deliver: Option<CancellationToken>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        fn deliver(&self, message: &SerialMessage) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Delivered(message.value.clone()));
            if let Some(token) = &self.cancel_on_deliver {
                token.cancel();
            }
        }

        async fn acknowledge(&self, ack: &[u8]) -> bool {
            self.events.lock().unwrap().push(Event::Ack(ack.to_vec()));
            true
        }
    }

    enum Step {
        Data(&'static [u8]),
        Fail,
    }

    struct ScriptedReader {
        steps: VecDeque<Step>,
    }

    impl ScriptedReader {
        fn boxed(steps: Vec<Step>) -> Box<dyn PortReader> {
            Box::new(Self {
                steps: steps.into(),
            })
        }
    }

    #[async_trait]
    impl PortReader for ScriptedReader {
        async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            match self.steps.pop_front() {
                Some(Step::Data(bytes)) => Ok(Some(bytes.to_vec())),
                Some(Step::Fail) => Err(TransportError::Other("line noise".into())),
                None => Ok(None),
            }
        }
    }

    fn delivered(v: &str) -> Event {
        Event::Delivered(v.to_string())
    }

    fn ack() -> Event {
        Event::Ack(vec![ACK_BYTE])
    }

    #[tokio::test]
    async fn test_frames_with_noise() {
        let sink = RecordingSink::default();
        let reader = ScriptedReader::boxed(vec![Step::Data(b"noise<AB>junk<CD>")]);

        let outcome = run_read_loop(reader, &sink, &CancellationToken::new()).await;

        assert_eq!(outcome, ReadOutcome::Ended);
        assert_eq!(
            sink.events(),
            vec![delivered("AB"), ack(), delivered("CD"), ack()]
        );
    }

    #[tokio::test]
    async fn test_restarted_frame() {
        let sink = RecordingSink::default();
        let reader = ScriptedReader::boxed(vec![Step::Data(b"<AB<CD>")]);

        run_read_loop(reader, &sink, &CancellationToken::new()).await;

        assert_eq!(sink.events(), vec![delivered("CD"), ack()]);
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks() {
        let sink = RecordingSink::default();
        let text = "<héllo><wörld>".as_bytes();
        // Split inside the two-byte 'é'
        let reader = ScriptedReader::boxed(vec![
            Step::Data(&text[..3]),
            Step::Data(&text[3..10]),
            Step::Data(&text[10..]),
        ]);

        run_read_loop(reader, &sink, &CancellationToken::new()).await;

        assert_eq!(
            sink.events(),
            vec![delivered("héllo"), ack(), delivered("wörld"), ack()]
        );
    }

    #[tokio::test]
    async fn test_error_stops_loop_without_partial_frame() {
        let sink = RecordingSink::default();
        let reader = ScriptedReader::boxed(vec![
            Step::Data(b"<one><tw"),
            Step::Fail,
            Step::Data(b"o>"),
        ]);

        let outcome = run_read_loop(reader, &sink, &CancellationToken::new()).await;

        assert_eq!(outcome, ReadOutcome::Failed);
        assert_eq!(sink.events(), vec![delivered("one"), ack()]);
    }

    #[tokio::test]
    async fn test_cancelled_before_read() {
        let sink = RecordingSink::default();
        let reader = ScriptedReader::boxed(vec![Step::Data(b"<AB>")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run_read_loop(reader, &sink, &cancel).await;

        assert_eq!(outcome, ReadOutcome::Cancelled);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_chunk_stops_delivery() {
        let cancel = CancellationToken::new();
        let sink = RecordingSink {
            cancel_on_deliver: Some(cancel.clone()),
            ..RecordingSink::default()
        };
        let reader = ScriptedReader::boxed(vec![Step::Data(b"<AB><CD><EF>")]);

        let outcome = run_read_loop(reader, &sink, &cancel).await;

        assert_eq!(outcome, ReadOutcome::Cancelled);
        assert_eq!(sink.events(), vec![delivered("AB"), ack()]);
    }
}
