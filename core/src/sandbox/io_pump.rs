use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::CappedCapture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn label(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One line of live output, forwarded when the caller asked to follow a run.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub line: String,
    pub stream: OutputStream,
}

/// Splits a byte stream into lines, holding back the trailing partial line.
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_nl) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_nl + 1);
        let mut complete = std::mem::replace(&mut self.pending, rest);
        complete.pop();
        complete.split(|&b| b == b'\n').map(decode_line).collect()
    }

    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| decode_line(&self.pending))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Drain `rd` into `capture` and return the total byte count. Reading continues past
/// the capture cap so the child never blocks on a full pipe. With `follow`, complete
/// lines are forwarded as they arrive and a final unterminated line at EOF.
pub fn pump<R>(
    mut rd: R,
    capture: Arc<CappedCapture>,
    follow: Option<mpsc::Sender<OutputLine>>,
    stream: OutputStream,
) -> JoinHandle<u64>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; 16 * 1024];
        let mut total = 0u64;
        let mut lines = LineSplitter::default();

        loop {
            let n = match rd.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(stream = stream.label(), error = %e, "pipe read failed");
                    break;
                }
            };
            total += n as u64;
            capture.push(&chunk[..n]);
            if let Some(tx) = &follow {
                for line in lines.feed(&chunk[..n]) {
                    let _ = tx.send(OutputLine { line, stream }).await;
                }
            }
        }

        if let (Some(tx), Some(line)) = (&follow, lines.finish()) {
            let _ = tx.send(OutputLine { line, stream }).await;
        }
        total
    })
}
