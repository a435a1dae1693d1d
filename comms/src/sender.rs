//! The sending end of the framed channel.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{BOOTSTRAP_MARKER, LEN_TYPE_SIZE, LenType};

/// The sending end handle of the communication.
pub struct ChannelSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> ChannelSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Writes the raw bootstrap marker. Workers call this once, before
    /// the first framed message.
    pub async fn send_bootstrap(&mut self) -> io::Result<()> {
        self.tx.write_all(BOOTSTRAP_MARKER).await?;
        self.tx.flush().await
    }

    /// Sends one framed message: a big-endian length prefix followed by
    /// the serialized body.
    ///
    /// # Errors
    /// Returns an `io::Error` if serialization or the write fails.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);
        serde_json::to_writer(&mut *buf, msg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let len = (buf.len() - LEN_TYPE_SIZE) as LenType;
        buf[..LEN_TYPE_SIZE].copy_from_slice(&len.to_be_bytes());

        tx.write_all(buf).await?;
        tx.flush().await
    }

    /// Closes the underlying writer, signalling end-of-stream to the
    /// peer.
    pub async fn close(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
