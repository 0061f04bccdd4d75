//! Transport abstraction.
//!
//! The broker and the client runtime only ever talk to a `dyn Transport`, so a
//! Unix socket, a TCP loopback connection, a Windows named pipe, stdio or an
//! in-memory duplex are interchangeable.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::debug;

use crate::{
    frame::{self, FrameError},
    message::{Envelope, ProtocolError},
};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame. Concurrent callers are serialized; frames never interleave.
    async fn send(&self, payload: &[u8]) -> Result<(), FrameError>;

    /// Receives one frame, or `None` once the peer has closed cleanly.
    async fn receive(&self) -> Result<Option<Vec<u8>>, FrameError>;

    fn is_connected(&self) -> bool;

    /// Cheap liveness check that does not put anything on the wire.
    async fn probe(&self) -> bool {
        self.is_connected()
    }

    async fn close(&self);

    /// Human readable peer description for logs.
    fn label(&self) -> &str;
}

/// Envelope-level helpers available on every transport.
#[async_trait]
pub trait TransportExt: Transport {
    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let bytes = envelope.to_bytes()?;
        self.send(&bytes).await?;
        Ok(())
    }

    /// `Ok(None)` on clean close. A frame that is not a valid envelope is
    /// reported as `ProtocolError::Malformed` without closing the transport.
    async fn receive_envelope(&self) -> Result<Option<Envelope>, ProtocolError> {
        match self.receive().await? {
            Some(bytes) => Ok(Some(Envelope::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Framed transport over any pair of async byte streams.
///
/// Reading and writing sit behind separate locks: the session's read loop can
/// block in `receive` while any number of callers send.
pub struct StreamTransport {
    label: String,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    connected: AtomicBool,
}

impl StreamTransport {
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            label: label.into(),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            connected: AtomicBool::new(true),
        }
    }

    pub fn from_stream<S>(label: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(label, reader, writer)
    }

    /// Frames over this process' stdin/stdout. Nothing else may write to stdout.
    pub fn stdio() -> Self {
        Self::new("stdio", tokio::io::stdin(), tokio::io::stdout())
    }

    fn mark_closed(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(peer = %self.label, "transport closed");
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, payload: &[u8]) -> Result<(), FrameError> {
        if !self.is_connected() {
            return Err(FrameError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let res = frame::write_frame(&mut *writer, payload).await;
        if let Err(e) = &res {
            // a failed write may have left half a frame on the wire
            if matches!(e, FrameError::Io(_)) || e.is_disconnect() {
                self.mark_closed();
            }
        }
        res
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, FrameError> {
        if !self.is_connected() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        let res = frame::read_frame(&mut *reader).await;
        match &res {
            Ok(None) => self.mark_closed(),
            // any framing failure leaves the stream position unknown
            Err(_) => self.mark_closed(),
            Ok(Some(_)) => {}
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = self.writer.lock().await;
        match writer.flush().await {
            Ok(()) => true,
            Err(_) => {
                drop(writer);
                self.mark_closed();
                false
            }
        }
    }

    async fn close(&self) {
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn label(&self) -> &str {
        &self.label
    }
}
