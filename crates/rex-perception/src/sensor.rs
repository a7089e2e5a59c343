//! Sensor feeds: bounded, lazy sequences of captured frames.
//!
//! Capture code owns a [`FeedSender`]; the consuming worker owns the matching
//! [`SensorFeed`] and pulls frames with [`SensorFeed::next`]. Two producer
//! policies are offered:
//!
//! | Method | When the buffer is full |
//! |---|---|
//! | [`FeedSender::push`] | waits for room (audio: every sample matters) |
//! | [`FeedSender::offer`] | drops the frame and counts it (camera: stale frames are worthless) |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rex_types::RexError;
use tokio::sync::mpsc;

/// A chunk of mono PCM audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate_hz: u32,
    pub captured_at: Instant,
}

/// A raw image frame.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    /// Raw pixel data (e.g. RGB24).
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

/// Create a feed buffering at most `capacity` frames.
pub fn sensor_channel<T>(capacity: usize) -> (FeedSender<T>, SensorFeed<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FeedSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        SensorFeed { rx },
    )
}

/// Producer half of a sensor feed.
#[derive(Debug)]
pub struct FeedSender<T> {
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for FeedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> FeedSender<T> {
    /// Wait for buffer space, then enqueue `frame`.
    pub async fn push(&self, frame: T) -> Result<(), RexError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RexError::Channel("sensor feed consumer gone".into()))
    }

    /// Enqueue `frame` if there is room, otherwise drop it.
    ///
    /// Returns whether the frame was accepted.
    pub fn offer(&self, frame: T) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Frames rejected by [`offer`](Self::offer) so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half of a sensor feed. Not restartable: once every sender is
/// gone and the buffer drains, [`next`](Self::next) yields `None` forever.
#[derive(Debug)]
pub struct SensorFeed<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> SensorFeed<T> {
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}
