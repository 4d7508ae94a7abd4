//! Newline-delimited JSON frames spoken with the edge over TCP.
//!
//! Every frame is one JSON object on its own line, tagged by `type`.
//! Unknown fields are ignored.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::TunnelError;

/// Longest line accepted from the edge.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Frames sent by this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Fresh registration of connection `index`.
    Register { client_id: String, index: usize },
    /// Re-registration that proves a previous session.
    Reconnect {
        client_id: String,
        index: usize,
        token: String,
        event_digest: String,
        conn_digest: String,
    },
    /// One reconnect-token authentication round trip.
    Authenticate {
        client_id: String,
        previous_attempts: u32,
    },
}

/// Frames sent by the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeFrame {
    Registered {
        event_digest: String,
        conn_digest: String,
    },
    /// Another connection already holds this registration.
    Duplicate,
    Rejected { reason: String },
    AuthSuccess {
        token: String,
        #[serde(default)]
        refresh_after_secs: u64,
    },
    AuthUnknown {
        reason: String,
        #[serde(default)]
        refresh_after_secs: u64,
    },
    AuthFail { reason: String },
}

pub async fn write_frame<W>(writer: &mut W, frame: &ClientFrame) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut line =
        serde_json::to_vec(frame).map_err(|e| TunnelError::Protocol(e.to_string()))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| TunnelError::Serve(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TunnelError::Serve(e.to_string()))
}

/// Read the next frame. `Ok(None)` means the edge closed the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<EdgeFrame>, TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_FRAME_LEN as u64)
        .read_line(&mut line)
        .await
        .map_err(|e| TunnelError::Serve(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    if n >= MAX_FRAME_LEN && !line.ends_with('\n') {
        return Err(TunnelError::Protocol(format!(
            "frame exceeds {MAX_FRAME_LEN} bytes"
        )));
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| TunnelError::Protocol(format!("bad frame from edge: {e}")))
}
