//! Drive the line extractor and frame decoder over an async byte stream.

use super::{LineBuffer, Utf8Decoder, decode_frame};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// How a relayed stream came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The transport closed the stream.
    Closed,
    /// The transport reported a read error.
    Failed(String),
    /// Nobody is listening for frames any more.
    ReceiverDropped,
}

/// Counters for one relayed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub lines: usize,
    pub frames: usize,
    pub end: StreamEnd,
}

/// Forward every frame found in `stream` to `tx`, in order.
///
/// Chunk and character boundaries are handled internally. When the stream
/// ends or fails, any unterminated tail is dropped: a line is only trusted
/// once its terminator has arrived. Dropping the receiver stops the relay
/// even while the stream is idle.
pub async fn relay_frames<S, B, E>(stream: S, tx: mpsc::Sender<Value>) -> RelaySummary
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = Utf8Decoder::new();
    let mut lines = LineBuffer::new();
    let mut summary = RelaySummary {
        lines: 0,
        frames: 0,
        end: StreamEnd::Closed,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!("frame receiver dropped while stream idle; stopping relay");
                summary.end = StreamEnd::ReceiverDropped;
                return summary;
            }
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "chat stream read failed");
                summary.end = StreamEnd::Failed(e.to_string());
                break;
            }
        };

        let text = decoder.decode(chunk.as_ref());
        for line in lines.feed(&text) {
            summary.lines += 1;
            let Some(frame) = decode_frame(&line) else {
                trace!(len = line.len(), "skipping non-frame line");
                continue;
            };
            summary.frames += 1;
            if tx.send(frame).await.is_err() {
                debug!("frame receiver dropped; stopping relay");
                summary.end = StreamEnd::ReceiverDropped;
                return summary;
            }
        }
    }

    decoder.finish();
    if let Some(tail) = lines.finish() {
        debug!(len = tail.len(), "discarding unterminated tail at end of stream");
    }
    debug!(
        lines = summary.lines,
        frames = summary.frames,
        end = ?summary.end,
        "chat stream ended"
    );
    summary
}
