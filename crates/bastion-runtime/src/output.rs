//! Bounded capture of payload output streams.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Output kept from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Lossy UTF-8 of the first `limit` bytes.
    pub text: String,
    /// Whether bytes past the limit were discarded.
    pub truncated: bool,
    /// Bytes the stream produced, kept or not.
    pub total_bytes: u64,
}

/// Reads `reader` to end, keeping at most `limit` bytes and draining the
/// rest. Stops early when `stop` fires.
pub async fn capture<R>(mut reader: R, limit: u64, stop: CancellationToken) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut total: u64 = 0;
    let mut buf = [0u8; 8192];
    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            () = stop.cancelled() => break,
        };
        total += n as u64;
        let room = limit.saturating_sub(kept.len() as u64);
        let take = (n as u64).min(room) as usize;
        kept.extend_from_slice(&buf[..take]);
    }
    CapturedOutput {
        text: String::from_utf8_lossy(&kept).into_owned(),
        truncated: total > limit,
        total_bytes: total,
    }
}

/// Collects a capture task, giving the stream `grace` to close on its own
/// before `stop` cuts it off.
pub async fn finish(
    task: Option<JoinHandle<CapturedOutput>>,
    stop: &CancellationToken,
    grace: Duration,
) -> CapturedOutput {
    let Some(mut task) = task else {
        return CapturedOutput::default();
    };
    match tokio::time::timeout(grace, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            stop.cancel();
            task.await.unwrap_or_default()
        }
    }
}

/// The last `max_chars` characters of `text`.
pub fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    text.char_indices()
        .nth(skip)
        .map_or(text, |(idx, _)| &text[idx..])
}
