//! Reader and writer tasks for byte transports.

use super::frame::FrameDecoder;
use super::{FlushState, LinkState, Mux};
use crate::config::MuxConfig;
use crate::error::Result;
use crate::transport::{BoxedReader, BoxedWriter};
use bytes::BytesMut;
use std::io;
use std::task::Poll;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub(super) async fn read_loop(mux: Mux, mut reader: BoxedReader) {
    let mut decoder = FrameDecoder::new(mux.options().ingress_queue_size_limit);
    let mut chunk = vec![0u8; MuxConfig::READ_CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = mux.ended() => return,
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                if decoder.buffered() > 0 {
                    debug!("Transport ended with {} undecoded bytes", decoder.buffered());
                }
                mux.close();
                return;
            }
            Ok(n) => {
                if let Err(err) = demux_chunk(&mux, &mut decoder, &chunk[..n]) {
                    mux.destroy(err);
                    return;
                }
            }
            Err(err) => {
                mux.destroy(err.into());
                return;
            }
        }
    }
}

fn demux_chunk(mux: &Mux, decoder: &mut FrameDecoder, chunk: &[u8]) -> Result<()> {
    decoder.push(chunk)?;
    while let Some(message) = decoder.next_message()? {
        mux.demux(message);
        if !mux.is_open() {
            break;
        }
    }
    Ok(())
}

pub(super) async fn write_loop(mux: Mux, mut writer: BoxedWriter) {
    // Bytes taken from the queue and not yet written. Survives an interrupted
    // write so a graceful close resumes mid-frame instead of tearing it.
    let mut in_flight = BytesMut::new();

    loop {
        tokio::select! {
            biased;
            _ = mux.ended() => break,
            _ = mux.flush_requested() => {}
        }

        match drain(&mux, &mut writer, &mut in_flight).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                mux.destroy(err.into());
                break;
            }
        }
    }

    if matches!(mux.state(), LinkState::Closed) {
        let final_flush = async {
            in_flight.unsplit(mux.take_bytes());
            writer.write_all_buf(&mut in_flight).await?;
            writer.shutdown().await
        };
        match tokio::time::timeout(MuxConfig::CLOSE_FLUSH_TIMEOUT, final_flush).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!("Final flush failed: {}", err),
            Err(_) => debug!("Final flush timed out"),
        }
    } else {
        mux.discard_egress();
    }
    mux.set_flush_state(FlushState::Idle);
}

/// Write queued bytes until the queue is empty.
///
/// Returns `Ok(false)` when the link ended while a write was waiting to drain;
/// the unwritten remainder is left in `in_flight`.
async fn drain(
    mux: &Mux,
    writer: &mut BoxedWriter,
    in_flight: &mut BytesMut,
) -> io::Result<bool> {
    loop {
        if in_flight.is_empty() {
            *in_flight = mux.take_bytes();
        }
        if in_flight.is_empty() {
            mux.set_flush_state(FlushState::Idle);
            return Ok(true);
        }
        mux.set_flush_state(FlushState::Flushing);

        let write = async {
            writer.write_all_buf(&mut *in_flight).await?;
            writer.flush().await
        };
        tokio::pin!(write);

        match futures::poll!(&mut write) {
            Poll::Ready(result) => result?,
            Poll::Pending => {
                mux.set_flush_state(FlushState::WaitingDrain);
                tokio::select! {
                    result = &mut write => result?,
                    _ = mux.ended() => return Ok(false),
                }
            }
        }
    }
}
