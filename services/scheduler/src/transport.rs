//! Outbound side of the resource manager connection.
//!
//! The scheduler only needs to send calls. Two implementations are provided:
//! - [`JsonLinesTransport`] writes one JSON call per line to any async writer
//! - [`RecordingTransport`] keeps calls in memory for tests

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use berth_events::Call;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from sending a call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode call: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Connection to the resource manager.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn send(&self, call: Call) -> Result<(), TransportError>;
}

/// Writes calls as newline-delimited JSON.
pub struct JsonLinesTransport<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Take the writer back.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> ResourceManager for JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, call: Call) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(&call)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        debug!(call = call.name(), "Sent call");
        Ok(())
    }
}

/// In-memory transport for testing.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Call>>,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that rejects every call.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(true),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    /// Calls sent so far.
    pub async fn sent(&self) -> Vec<Call> {
        self.sent.lock().await.clone()
    }

    pub async fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

#[async_trait]
impl ResourceManager for RecordingTransport {
    async fn send(&self, call: Call) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(
                "recording transport configured to fail".to_string(),
            ));
        }
        debug!(call = call.name(), "[MOCK] Recorded call");
        self.sent.lock().await.push(call);
        Ok(())
    }
}
