use std::collections::VecDeque;

/// Fixed-capacity FIFO that evicts its oldest entry when full.
pub struct RingBuffer<T> {
    max: usize,
    buf: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            buf: VecDeque::with_capacity(max.max(1)),
        }
    }

    /// Append `item`, returning the entry it displaced if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.buf.len() == self.max {
            self.buf.pop_front()
        } else {
            None
        };
        self.buf.push_back(item);
        evicted
    }

    pub fn pop_oldest(&mut self) -> Option<T> {
        self.buf.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
