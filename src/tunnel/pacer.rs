//! Per-stream selective-repeat reliability
//!
//! A [`SendPacer`] slices an outgoing byte stream into sequenced FWD frames
//! and keeps every frame until it is acknowledged. The low edge of the send
//! window (`wait_ack`) only moves once every sequence below it has been
//! acknowledged; acknowledgements above a gap are held in a min-heap until
//! the gap closes.
//!
//! A [`RecvPacer`] buffers out-of-order frames and releases them strictly
//! in sequence order.

use super::Frame;
use crate::protocol::{MAX_FRAME_PAYLOAD, MAX_WINDOW, MIN_WINDOW};
use bytes::{Bytes, BytesMut};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Min-heap of sequence numbers
#[derive(Debug, Default)]
pub struct SeqHeap {
    heap: BinaryHeap<Reverse<u64>>,
}

impl SeqHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, seq: u64) {
        self.heap.push(Reverse(seq));
    }

    /// Smallest sequence, if any
    pub fn peek(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(seq)| *seq)
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.heap.pop().map(|Reverse(seq)| seq)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Sender side of a stream
#[derive(Debug)]
pub struct SendPacer {
    src: u64,
    dst: u64,
    /// Bytes not yet sliced into frames
    buffer: BytesMut,
    /// Lowest unacknowledged sequence
    wait_ack: u64,
    /// Next sequence to emit
    pivot: u64,
    window: u64,
    /// Sent but unacknowledged frames
    outstanding: HashMap<u64, Frame>,
    /// Acknowledged sequences above `wait_ack`
    acks: SeqHeap,
}

impl SendPacer {
    /// Create a pacer for stream `src` talking to remote stream `dst`
    pub fn new(src: u64, dst: u64, window: u64) -> Self {
        Self {
            src,
            dst,
            buffer: BytesMut::new(),
            wait_ack: 0,
            pivot: 0,
            window: window.clamp(MIN_WINDOW, MAX_WINDOW),
            outstanding: HashMap::new(),
            acks: SeqHeap::new(),
        }
    }

    /// Queue bytes for sending
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Whether another frame may be emitted right now
    pub fn can_pop(&self) -> bool {
        !self.buffer.is_empty() && self.pivot < self.wait_ack + self.window
    }

    /// Slice the next FWD frame off the buffer, if the window allows
    pub fn pop_frame(&mut self) -> Option<Frame> {
        if !self.can_pop() {
            return None;
        }

        let len = self.buffer.len().min(MAX_FRAME_PAYLOAD);
        let payload: Bytes = self.buffer.split_to(len).freeze();
        let frame = Frame::fwd(self.pivot, self.src, self.dst, payload);

        self.outstanding.insert(self.pivot, frame.clone());
        self.pivot += 1;

        Some(frame)
    }

    /// Pop every frame the window currently allows
    pub fn pop_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.pop_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Record an acknowledgement. Returns `true` if `seq` was outstanding.
    pub fn recv_ack(&mut self, seq: u64) -> bool {
        if self.outstanding.remove(&seq).is_none() {
            return false;
        }

        self.acks.push(seq);
        while self.acks.peek() == Some(self.wait_ack) {
            self.acks.pop();
            self.wait_ack += 1;
        }

        true
    }

    /// Outstanding frames within `[wait_ack, wait_ack + window)`, in sequence order
    pub fn selective_repeat(&self) -> Vec<Frame> {
        let end = self.wait_ack.saturating_add(self.window).min(self.pivot);
        (self.wait_ack..end)
            .filter_map(|seq| self.outstanding.get(&seq).cloned())
            .collect()
    }

    /// Double the window, capped at [`MAX_WINDOW`]
    pub fn scale_up(&mut self) {
        self.window = (self.window * 2).min(MAX_WINDOW);
    }

    /// Shrink the window to 70%, floored at [`MIN_WINDOW`]
    pub fn scale_down(&mut self) {
        self.window = (self.window * 7 / 10).max(MIN_WINDOW);
    }

    /// Whether every emitted frame has been acknowledged
    pub fn all_acked(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Whether no unsliced bytes remain
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether everything pushed has been sent and acknowledged
    pub fn is_drained(&self) -> bool {
        self.is_empty() && self.all_acked()
    }

    /// SENDFIN carrying the first sequence never sent
    pub fn done(&self) -> Frame {
        Frame::send_fin(self.pivot, self.src, self.dst)
    }

    pub fn wait_ack(&self) -> u64 {
        self.wait_ack
    }

    pub fn pivot(&self) -> u64 {
        self.pivot
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// Number of unacknowledged frames
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }
}

/// Receiver side of a stream
#[derive(Debug, Default)]
pub struct RecvPacer {
    /// Next sequence expected
    wait_seq: u64,
    frames: HashMap<u64, Frame>,
    seqs: SeqHeap,
}

impl RecvPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a frame. Stale, already-buffered and out-of-window sequences
    /// are ignored.
    pub fn push_frame(&mut self, frame: Frame) {
        if frame.seq < self.wait_seq || frame.seq - self.wait_seq >= MAX_WINDOW {
            return;
        }
        if self.frames.contains_key(&frame.seq) {
            return;
        }

        self.seqs.push(frame.seq);
        self.frames.insert(frame.seq, frame);
    }

    /// Next in-order frame, if it has arrived
    pub fn pop_frame(&mut self) -> Option<Frame> {
        if self.seqs.peek() != Some(self.wait_seq) {
            return None;
        }

        let seq = self.seqs.pop()?;
        self.wait_seq += 1;
        self.frames.remove(&seq)
    }

    /// Every frame that is now contiguous with the delivered prefix
    pub fn ready_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.pop_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Concatenated payload of [`RecvPacer::ready_frames`]
    pub fn drain_ready(&mut self) -> BytesMut {
        let mut buf = BytesMut::new();
        while let Some(frame) = self.pop_frame() {
            buf.extend_from_slice(&frame.payload);
        }
        buf
    }

    pub fn wait_seq(&self) -> u64 {
        self.wait_seq
    }

    /// Number of frames buffered out of order
    pub fn buffered(&self) -> usize {
        self.frames.len()
    }
}
