use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const MARKER_PREFIX: &str = "...[truncated ";

/// True for the line a capped capture appends after dropping bytes.
pub fn is_truncation_marker(line: &str) -> bool {
    line.starts_with(MARKER_PREFIX) && line.ends_with(" bytes]")
}

/// Which end of an oversized stream survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Keep the first `cap` bytes (stdout: results come first).
    Head,
    /// Keep the last `cap` bytes (stderr: the traceback ends the stream).
    Tail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
    pub dropped: u64,
}

/// Byte-capped capture buffer shared between a pump task and the runner.
pub struct CappedCapture {
    inner: Mutex<Inner>,
    cap: usize,
    mode: CaptureMode,
}

struct Inner {
    buf: VecDeque<u8>,
    dropped: u64,
}

impl CappedCapture {
    pub fn new(cap: usize, mode: CaptureMode) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(cap.min(64 * 1024)),
                dropped: 0,
            }),
            cap,
            mode,
        })
    }

    pub fn push(&self, data: &[u8]) {
        let mut g = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match self.mode {
            CaptureMode::Head => {
                let room = self.cap.saturating_sub(g.buf.len());
                let take = room.min(data.len());
                g.buf.extend(&data[..take]);
                g.dropped += (data.len() - take) as u64;
            }
            CaptureMode::Tail => {
                let data = if data.len() > self.cap {
                    g.dropped += (data.len() - self.cap) as u64;
                    &data[data.len() - self.cap..]
                } else {
                    data
                };
                let overflow = g.buf.len().saturating_add(data.len()).saturating_sub(self.cap);
                if overflow > 0 {
                    g.buf.drain(..overflow);
                    g.dropped += overflow as u64;
                }
                g.buf.extend(data);
            }
        }
    }

    pub fn finish(&self) -> CapturedOutput {
        let g = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bytes: Vec<u8> = g.buf.iter().copied().collect();
        let body = String::from_utf8_lossy(&bytes);
        if g.dropped == 0 {
            return CapturedOutput {
                text: body.into_owned(),
                truncated: false,
                dropped: 0,
            };
        }
        // Always last, whichever end was dropped.
        let text = format!("{body}\n{MARKER_PREFIX}{} bytes]", g.dropped);
        CapturedOutput {
            text,
            truncated: true,
            dropped: g.dropped,
        }
    }
}
