//! The room live tail: cursor-driven resume plus live push.
//!
//! `tail_room(room_id, from_seq)` yields every room-stream event with
//! `stream_seq > from_seq` in ascending order, then keeps yielding new
//! events as they commit, each exactly once and in strict order. The
//! subscription is taken *before* the historical read so nothing can fall
//! in the gap; live events at or below the cursor are deduplicated, and a
//! sequence jump (broadcast lag) triggers a store re-read from the cursor.
//!
//! Back-pressure: the consumer channel is bounded. When the consumer stops
//! draining and the buffer fills, the tail closes; the client reconnects
//! with the last sequence it received as the new cursor.

use tokio::sync::mpsc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use aegis_store_core::{EventEnvelope, EventStore};
use aegis_types::StreamRef;

use crate::{Kernel, KernelError};

/// Default consumer buffer depth before the tail closes.
pub const DEFAULT_TAIL_BUFFER: usize = 256;

impl Kernel {
    /// Tail a room's stream from `from_seq` with the default buffer.
    pub async fn tail_room(
        &self,
        room_id: Uuid,
        from_seq: u64,
    ) -> Result<mpsc::Receiver<EventEnvelope>, KernelError> {
        self.tail_room_buffered(room_id, from_seq, DEFAULT_TAIL_BUFFER).await
    }

    /// Tail a room's stream with an explicit buffer depth.
    pub async fn tail_room_buffered(
        &self,
        room_id: Uuid,
        from_seq: u64,
        buffer: usize,
    ) -> Result<mpsc::Receiver<EventEnvelope>, KernelError> {
        let stream = StreamRef::room(room_id);
        let store = self.store().clone();
        // Subscribe before the catch-up read so no commit falls in between.
        let mut live = store.subscribe();
        let (tx, rx) = mpsc::channel(buffer);

        tokio::spawn(async move {
            let mut cursor = from_seq;

            // Phase 1: replay history past the cursor.
            match store.read_stream(stream, cursor, None).await {
                Ok(history) => {
                    for event in history {
                        cursor = event.stream_seq;
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(%room_id, error = %err, "tail catch-up read failed");
                    return;
                }
            }

            // Phase 2: follow the live feed, deduplicating on sequence.
            loop {
                let event = match live.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(%room_id, skipped, "tail lagged behind broadcast, re-reading");
                        match store.read_stream(stream, cursor, None).await {
                            Ok(missed) => {
                                for event in missed {
                                    cursor = event.stream_seq;
                                    if try_forward(&tx, event) {
                                        return;
                                    }
                                }
                                continue;
                            }
                            Err(err) => {
                                warn!(%room_id, error = %err, "tail re-read failed");
                                return;
                            }
                        }
                    }
                    Err(RecvError::Closed) => return,
                };

                if event.stream.stream_type != stream.stream_type
                    || event.stream.stream_id != stream.stream_id
                    || event.stream_seq <= cursor
                {
                    continue;
                }
                // A gap means the broadcast dropped something for us; fill
                // from the store before continuing.
                if event.stream_seq > cursor + 1 {
                    match store.read_stream(stream, cursor, None).await {
                        Ok(missed) => {
                            for event in missed {
                                cursor = event.stream_seq;
                                if try_forward(&tx, event) {
                                    return;
                                }
                            }
                            continue;
                        }
                        Err(err) => {
                            warn!(%room_id, error = %err, "tail gap fill failed");
                            return;
                        }
                    }
                }
                cursor = event.stream_seq;
                if try_forward(&tx, event) {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Forward an event without awaiting: a full buffer means the consumer has
/// stopped draining, and the tail closes so the client can resume from its
/// cursor. Returns `true` when the tail should end.
fn try_forward(tx: &mpsc::Sender<EventEnvelope>, event: EventEnvelope) -> bool {
    match tx.try_send(event) {
        Ok(()) => false,
        Err(mpsc::error::TrySendError::Full(event)) => {
            debug!(
                seq = event.stream_seq,
                "tail consumer back-pressure threshold reached, closing"
            );
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => true,
    }
}
