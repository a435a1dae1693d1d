pub mod msg;
mod receiver;
mod sender;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use receiver::ChannelReceiver;
pub use sender::ChannelSender;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Literal readiness marker a worker writes on its raw transport before
/// switching the channel into framed mode. The controlling side blocks
/// on this marker during bootstrap.
pub const BOOTSTRAP_MARKER: &[u8] = b"channel-up\n";

/// Creates both channel ends over a reader/writer pair.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// The receiving and sending halves of the communication.
pub fn channel<R, W>(rx: R, tx: W) -> (ChannelReceiver<R>, ChannelSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (ChannelReceiver::new(rx), ChannelSender::new(tx))
}
