//! Reader and writer tasks for object transports.

use super::{FlushState, LinkState, Mux};
use crate::config::MuxConfig;
use crate::message::Message;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

pub(super) async fn read_loop(mux: Mux, mut receiver: mpsc::Receiver<Message>) {
    loop {
        let message = tokio::select! {
            _ = mux.ended() => return,
            message = receiver.recv() => message,
        };

        match message {
            Some(message) => mux.demux(message),
            None => {
                mux.close();
                return;
            }
        }
    }
}

pub(super) async fn write_loop(mux: Mux, sender: mpsc::Sender<Message>) {
    // A message taken from the queue while the channel was full.
    let mut in_flight: Option<Message> = None;

    loop {
        tokio::select! {
            biased;
            _ = mux.ended() => break,
            _ = mux.flush_requested() => {}
        }

        if !drain(&mux, &sender, &mut in_flight).await {
            break;
        }
    }

    if matches!(mux.state(), LinkState::Closed) {
        let final_flush = async {
            while let Some(message) = in_flight.take().or_else(|| mux.pop_object()) {
                if sender.send(message).await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(MuxConfig::CLOSE_FLUSH_TIMEOUT, final_flush)
            .await
            .is_err()
        {
            debug!("Final flush timed out");
        }
    }
    mux.discard_egress();
    mux.set_flush_state(FlushState::Idle);
}

/// Send queued messages until the queue is empty.
///
/// Returns `false` once the link has ended. A message still waiting for
/// channel capacity at that point is left in `in_flight`.
async fn drain(
    mux: &Mux,
    sender: &mpsc::Sender<Message>,
    in_flight: &mut Option<Message>,
) -> bool {
    while let Some(message) = in_flight.take().or_else(|| mux.pop_object()) {
        mux.set_flush_state(FlushState::Flushing);

        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                mux.set_flush_state(FlushState::WaitingDrain);
                *in_flight = Some(message);
                let reserved = tokio::select! {
                    reserved = sender.reserve() => reserved,
                    _ = mux.ended() => return false,
                };
                match reserved {
                    Ok(permit) => {
                        if let Some(message) = in_flight.take() {
                            permit.send(message);
                        }
                    }
                    Err(_) => {
                        mux.close();
                        return false;
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                mux.close();
                return false;
            }
        }
    }
    mux.set_flush_state(FlushState::Idle);
    true
}
