use std::io;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time;

use crate::{BOOTSTRAP_MARKER, LEN_TYPE_SIZE, LenType};

/// The receiving end handle of the communication.
pub struct ChannelReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChannelReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::new(),
        }
    }

    /// Blocks until the peer's bootstrap marker arrives.
    ///
    /// # Errors
    /// Returns `TimedOut` if the marker does not arrive within
    /// `timeout`, so channel setup fails instead of hanging, and
    /// `InvalidData` if the peer wrote something else first.
    pub async fn wait_bootstrap(&mut self, timeout: Duration) -> io::Result<()> {
        let mut marker = [0u8; BOOTSTRAP_MARKER.len()];
        match time::timeout(timeout, self.rx.read_exact(&mut marker)).await {
            Ok(res) => {
                res?;
            }
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "bootstrap marker not received",
                ));
            }
        }

        if marker != *BOOTSTRAP_MARKER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected bootstrap marker",
            ));
        }

        Ok(())
    }

    /// Waits for the next framed message.
    ///
    /// # Returns
    /// `Ok(None)` on clean end-of-stream: the peer closed the channel
    /// before the next length prefix. A frame whose body fails to
    /// decode yields `InvalidData`; framing stays intact, so the caller
    /// may skip the frame and keep receiving.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        let mut len_buf = [0u8; LEN_TYPE_SIZE];
        match self.rx.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = LenType::from_be_bytes(len_buf) as usize;
        self.buf.resize(len, 0);
        self.rx.read_exact(&mut self.buf).await?;

        let value = serde_json::from_slice(&self.buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(value))
    }
}
