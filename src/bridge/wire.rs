//! Newline-delimited JSON framing for the bridge.

use super::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Cancel {
        id: u64,
    },
    Reply {
        id: u64,
        value: Value,
    },
    Fault {
        id: u64,
        error: BridgeError,
    },
    OpenStream {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    StopStream {
        id: u64,
    },
    Item {
        id: u64,
        value: Value,
    },
    End {
        id: u64,
    },
    Failed {
        id: u64,
        error: BridgeError,
    },
    Stopped {
        id: u64,
    },
}

pub struct FrameReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next well-formed frame, or `None` at end of input. Malformed lines
    /// are logged and skipped.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Frame>(line) {
                Ok(frame) => return Ok(Some(frame)),
                Err(err) => warn!(error = %err, "Skipping malformed bridge frame"),
            }
        }
        Ok(None)
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        let payload = serde_json::to_string(frame)?;
        debug!(bytes = payload.len(), "Writing bridge frame");
        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}
