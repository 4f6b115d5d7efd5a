//! Duplex transports consumed by a `Mux`.
//!
//! Establishing connections is left to the caller. A transport is either a byte
//! stream (any tokio `AsyncRead` + `AsyncWrite`) or an in-process channel of
//! whole messages.

use crate::config::MuxConfig;
use crate::message::Message;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One end of a bounded, bidirectional message channel.
///
/// A full channel is the object-mode backpressure signal; dropping either end
/// closes the link for the peer.
#[derive(Debug)]
pub struct ObjectStream {
    sender: mpsc::Sender<Message>,
    receiver: mpsc::Receiver<Message>,
}

impl ObjectStream {
    /// Create two connected ends, each direction buffering up to `capacity`
    /// messages.
    pub fn pair(capacity: usize) -> (ObjectStream, ObjectStream) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        (
            ObjectStream {
                sender: a_tx,
                receiver: b_rx,
            },
            ObjectStream {
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }

    /// Connected ends using the default channel capacity.
    pub fn default_pair() -> (ObjectStream, ObjectStream) {
        Self::pair(MuxConfig::OBJECT_CHANNEL_CAPACITY)
    }

    pub fn into_parts(self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        (self.sender, self.receiver)
    }
}

/// A duplex link handed to a `Mux`.
pub enum Transport {
    /// Raw bytes, framed with a 6-byte length prefix.
    Bytes {
        reader: BoxedReader,
        writer: BoxedWriter,
    },
    /// Discrete messages, no framing.
    Objects(ObjectStream),
}

impl Transport {
    /// Wrap a byte stream, splitting it into read and write halves.
    pub fn bytes<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Transport::Bytes {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Wrap separately owned read and write halves (e.g. child stdio).
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Transport::Bytes {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn objects(stream: ObjectStream) -> Self {
        Transport::Objects(stream)
    }

    pub fn is_object_mode(&self) -> bool {
        matches!(self, Transport::Objects(_))
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Bytes { .. } => f.write_str("Transport::Bytes"),
            Transport::Objects(_) => f.write_str("Transport::Objects"),
        }
    }
}

impl From<TcpStream> for Transport {
    fn from(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Transport::from_split(reader, writer)
    }
}

impl From<tokio::io::DuplexStream> for Transport {
    fn from(stream: tokio::io::DuplexStream) -> Self {
        Transport::bytes(stream)
    }
}

impl From<ObjectStream> for Transport {
    fn from(stream: ObjectStream) -> Self {
        Transport::Objects(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, ResultMessage};

    #[tokio::test]
    async fn test_object_pair_is_cross_connected() {
        let (left, right) = ObjectStream::pair(4);
        let (left_tx, _left_rx) = left.into_parts();
        let (_right_tx, mut right_rx) = right.into_parts();

        let message = Message::Result(ResultMessage::success("1", serde_json::json!(true)));
        left_tx.send(message.clone()).await.unwrap();
        assert_eq!(right_rx.recv().await, Some(message));
    }

    #[test]
    fn test_mode_detection() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        assert!(!Transport::from(a).is_object_mode());

        let (left, _right) = ObjectStream::pair(1);
        assert!(Transport::objects(left).is_object_mode());
    }
}
