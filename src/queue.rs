//! Bounded frame queue between the feeders and the processing thread.
//!
//! Built on a tokio bounded channel driven from plain threads: feeders block
//! in `blocking_send` when the queue is full, interrupt-context feeders use
//! `try_send` and get [`AfeError::QueueFull`] instead.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{AfeError, AfeResult};

/// One frame: non-interleaved input plus an optional echo reference.
///
/// The buffers are shared with the feeder, so a frame stays readable until
/// the output callback for it has returned.
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    input: Arc<[i16]>,
    aec_ref: Option<Arc<[i16]>>,
    #[cfg(feature = "crc")]
    crc: u32,
}

impl FrameDescriptor {
    pub fn new(input: Arc<[i16]>, aec_ref: Option<Arc<[i16]>>) -> Self {
        Self {
            #[cfg(feature = "crc")]
            crc: frame_checksum(&input),
            input,
            aec_ref,
        }
    }

    pub fn input(&self) -> &[i16] {
        &self.input
    }

    pub fn aec_ref(&self) -> Option<&[i16]> {
        self.aec_ref.as_deref()
    }

    /// Checks the input against the checksum taken at feed time.
    #[cfg(feature = "crc")]
    pub fn verify(&self) -> AfeResult<()> {
        let computed = frame_checksum(&self.input);
        if computed != self.crc {
            log::error!(
                "Frame checksum mismatch: expected {:#010x}, computed {:#010x}",
                self.crc,
                computed
            );
            return Err(AfeError::CrcChecksum {
                expected: self.crc,
                computed,
            });
        }
        Ok(())
    }

    #[cfg(not(feature = "crc"))]
    pub fn verify(&self) -> AfeResult<()> {
        Ok(())
    }
}

/// First 32-bit word of the frame XOR the last one.
pub fn frame_checksum(samples: &[i16]) -> u32 {
    fn word(lo: i16, hi: i16) -> u32 {
        (lo as u16 as u32) | ((hi as u16 as u32) << 16)
    }
    match samples.len() {
        0 | 1 => 0,
        n => word(samples[0], samples[1]) ^ word(samples[n - 2], samples[n - 1]),
    }
}

pub(crate) enum QueueItem {
    Frame(FrameDescriptor),
    /// Nudges the processing thread so it re-checks its running flag.
    Wake,
}

/// Producer side. Cheap to clone.
#[derive(Clone)]
pub(crate) struct FrameQueue {
    tx: mpsc::Sender<QueueItem>,
}

pub(crate) struct FrameReceiver {
    rx: mpsc::Receiver<QueueItem>,
}

pub(crate) fn frame_queue(capacity: usize) -> AfeResult<(FrameQueue, FrameReceiver)> {
    if capacity == 0 {
        return Err(AfeError::BadArg("queue capacity must be at least one frame"));
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((FrameQueue { tx }, FrameReceiver { rx }))
}

impl FrameQueue {
    /// Blocks while the queue is full. Must not be called from inside an
    /// async runtime.
    pub fn push(&self, frame: FrameDescriptor) -> AfeResult<()> {
        self.tx
            .blocking_send(QueueItem::Frame(frame))
            .map_err(|_| AfeError::Generic("processing task has stopped".into()))
    }

    /// Never blocks.
    pub fn push_from_isr(&self, frame: FrameDescriptor) -> AfeResult<()> {
        match self.tx.try_send(QueueItem::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AfeError::QueueFull),
            Err(TrySendError::Closed(_)) => {
                Err(AfeError::Generic("processing task has stopped".into()))
            }
        }
    }

    /// Frames currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn wake(&self) {
        // 队列满时处理线程本来就醒着，下一次 pop 之后会重新检查 running，
        // 所以这里不能改成阻塞发送
        let _ = self.tx.try_send(QueueItem::Wake);
    }
}

impl FrameReceiver {
    /// Blocks until an item arrives. `None` once every producer is gone.
    pub fn pop(&mut self) -> Option<QueueItem> {
        self.rx.blocking_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: i16) -> FrameDescriptor {
        FrameDescriptor::new(vec![tag; 160].into(), None)
    }

    fn tag_of(item: QueueItem) -> i16 {
        match item {
            QueueItem::Frame(f) => f.input()[0],
            QueueItem::Wake => -1,
        }
    }

    #[test]
    fn frames_come_out_in_order() {
        let (q, mut rx) = frame_queue(4).unwrap();
        for i in 0..3 {
            q.push(frame(i)).unwrap();
        }
        assert_eq!(q.len(), 3);
        let got: Vec<i16> = (0..3).map(|_| tag_of(rx.pop().unwrap())).collect();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn isr_push_reports_full_queue() {
        let (q, _rx) = frame_queue(2).unwrap();
        q.push_from_isr(frame(1)).unwrap();
        q.push_from_isr(frame(2)).unwrap();
        assert_eq!(q.push_from_isr(frame(3)), Err(AfeError::QueueFull));
        assert_eq!(q.capacity(), 2);
    }

    #[test]
    fn wake_never_blocks() {
        let (q, mut rx) = frame_queue(1).unwrap();
        q.push(frame(1)).unwrap();
        // full: the sentinel is dropped and the frame stays queued
        q.wake();
        assert_eq!(q.len(), 1);
        assert_eq!(tag_of(rx.pop().unwrap()), 1);

        q.wake();
        assert_eq!(tag_of(rx.pop().unwrap()), -1);
    }

    #[test]
    fn closed_queue_is_an_error() {
        let (q, rx) = frame_queue(2).unwrap();
        drop(rx);
        assert!(matches!(q.push(frame(1)), Err(AfeError::Generic(_))));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(frame_queue(0).is_err());
    }

    #[test]
    fn checksum_uses_first_and_last_words() {
        let mut s = vec![0i16; 160];
        s[0] = 1;
        s[159] = 2;
        assert_eq!(frame_checksum(&s), 1 ^ (2 << 16));
        assert_eq!(frame_checksum(&[5]), 0);
        assert!(frame(3).verify().is_ok());
    }
}
