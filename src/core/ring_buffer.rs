//! Lock-Free Multi-Producer Single-Consumer (MPSC) Ring Buffer
//!
//! Bounded queue with a sequence counter per slot. Producers claim slots by
//! CAS on `tail`; the single consumer owns `head` outright.
//! No Mutex, no allocation after construction.
//!
//! Slot protocol (for write index `t` / read index `h`):
//! - `sequence == t`      → free for the producer that claims `t`
//! - `sequence == h + 1`  → published, ready for the consumer
//! - `sequence == h + N`  → consumed, free for the next lap

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::backoff::Backoff;
use crate::config::BackoffConfig;
use crate::error::{Error, Result};

/// One slot: sequence counter plus value, on its own cache line.
#[repr(C, align(64))]
struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new(sequence: usize) -> Self {
        Self {
            sequence: AtomicUsize::new(sequence),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Padding for cache line isolation (64 bytes on x86-64)
#[repr(C, align(64))]
struct CacheLinePadded<T> {
    value: T,
}

impl<T> CacheLinePadded<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

/// Bounded lock-free MPSC ring buffer.
///
/// `offer` may be called from any number of threads. `poll` and
/// `poll_batch` need `&mut self`; to consume from a different thread than
/// the producers, [`split`](RingBuffer::split) the buffer into a cloneable
/// [`Producer`] and a unique [`Consumer`].
#[repr(C)]
pub struct RingBuffer<T> {
    // Consumer side - only the consumer stores here
    head: CacheLinePadded<AtomicUsize>,
    // Producer side - advanced by CAS only
    tail: CacheLinePadded<AtomicUsize>,
    buffer: Box<[Slot<T>]>,
    mask: usize,
    // Logical capacity; below the slot count only when capacity is 1
    capacity: usize,
    backoff: BackoffConfig,
}

// SAFETY: values cross threads exactly once (producer → consumer), and a
// slot's value is only touched by the thread that owns it under the
// sequence protocol. Release on publish / Acquire on read order the value
// write before the consumer's read.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates a ring buffer with `capacity` slots.
    ///
    /// # Errors
    /// [`Error::InvalidCapacity`] when `capacity` is zero or not a power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_backoff(capacity, BackoffConfig::default())
    }

    /// Like [`new`](Self::new) with a custom retry policy for contended offers.
    ///
    /// # Errors
    /// [`Error::Config`] when `backoff` fails [`BackoffConfig::validate`].
    pub fn with_backoff(capacity: usize, backoff: BackoffConfig) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity(capacity));
        }
        backoff.validate()?;

        // With a single slot "published" (t + 1) and "free for the next lap"
        // (h + N) are the same sequence. Two slots keep them apart; the
        // limit of one is enforced against `head` in `try_offer`.
        let slots = capacity.max(2);
        let buffer: Box<[Slot<T>]> = (0..slots).map(Slot::new).collect();

        Ok(Self {
            head: CacheLinePadded::new(AtomicUsize::new(0)),
            tail: CacheLinePadded::new(AtomicUsize::new(0)),
            buffer,
            mask: slots - 1,
            capacity,
            backoff,
        })
    }

    /// Enqueue (producer side). `false` means the buffer is full.
    #[inline]
    pub fn offer(&self, value: T) -> bool {
        self.try_offer(value).is_ok()
    }

    /// Enqueue, handing the value back when the buffer is full.
    ///
    /// Never blocks on a full buffer. Losing a race against another producer
    /// retries with spin → yield → jittered park.
    pub fn try_offer(&self, value: T) -> std::result::Result<(), T> {
        let mut backoff = Backoff::new(self.backoff);
        let mut tail = self.tail.value.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[tail & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let dif = sequence.wrapping_sub(tail) as isize;

            if dif == 0 {
                if self.capacity <= self.mask
                    && tail.wrapping_sub(self.head.value.load(Ordering::Acquire)) >= self.capacity
                {
                    // A stale head only makes this reject early, never admit extra
                    return Err(value);
                }
                // Relaxed is enough on the cursor: the slot sequence carries
                // the happens-before edge to the consumer.
                match self.tail.value.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this thread the only owner of
                        // slot `tail` until the sequence store below.
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.sequence.store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => {
                        tail = current;
                        backoff.snooze();
                    }
                }
            } else if dif < 0 {
                // Previous lap not consumed yet: full
                return Err(value);
            } else {
                // Another producer moved tail past our read
                backoff.snooze();
                tail = self.tail.value.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue one value. `None` when the next slot is not published yet.
    #[inline]
    pub fn poll(&mut self) -> Option<T> {
        // SAFETY: `&mut self` excludes every other consumer.
        unsafe { self.poll_unsync() }
    }

    /// Drains up to `max` contiguous ready values into `dst`, in FIFO order.
    ///
    /// Stops at the first slot that is not yet published; returns the number
    /// of values appended.
    #[inline]
    pub fn poll_batch(&mut self, dst: &mut Vec<T>, max: usize) -> usize {
        // SAFETY: `&mut self` excludes every other consumer.
        unsafe { self.poll_batch_unsync(dst, max) }
    }

    /// # Safety
    /// Caller guarantees no other thread is inside a consumer method.
    #[inline(always)]
    unsafe fn poll_unsync(&self) -> Option<T> {
        let head = self.head.value.load(Ordering::Relaxed);
        let slot = &self.buffer[head & self.mask];
        let sequence = slot.sequence.load(Ordering::Acquire);

        if sequence != head.wrapping_add(1) {
            return None;
        }

        // SAFETY: the Acquire above pairs with the producer's Release, so the
        // value is fully written; no producer touches the slot until we
        // publish the next-lap sequence.
        let value = (*slot.value.get()).assume_init_read();

        self.head.value.store(head.wrapping_add(1), Ordering::Release);
        slot.sequence
            .store(head.wrapping_add(self.mask + 1), Ordering::Release);

        Some(value)
    }

    /// # Safety
    /// Caller guarantees no other thread is inside a consumer method.
    unsafe fn poll_batch_unsync(&self, dst: &mut Vec<T>, max: usize) -> usize {
        let start = self.head.value.load(Ordering::Relaxed);
        let mut head = start;

        while head.wrapping_sub(start) < max {
            let slot = &self.buffer[head & self.mask];
            if slot.sequence.load(Ordering::Acquire) != head.wrapping_add(1) {
                break;
            }

            // SAFETY: same argument as `poll_unsync`.
            dst.push((*slot.value.get()).assume_init_read());
            slot.sequence
                .store(head.wrapping_add(self.mask + 1), Ordering::Release);
            head = head.wrapping_add(1);
        }

        if head != start {
            self.head.value.store(head, Ordering::Release);
        }
        head.wrapping_sub(start)
    }

    /// Snapshot of the number of queued values. May be stale under
    /// concurrent producers, never negative, never above capacity.
    #[inline(always)]
    pub fn size(&self) -> usize {
        // head first: a later tail read can only be larger
        let head = self.head.value.load(Ordering::Acquire);
        let tail = self.tail.value.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.size() == self.capacity()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Splits into a cloneable producer handle and the unique consumer.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let ring = Arc::new(self);
        (
            Producer {
                ring: Arc::clone(&ring),
            },
            Consumer { ring },
        )
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        // Drop values that were published but never consumed
        while self.poll().is_some() {}
    }
}

/// Producer half of a split [`RingBuffer`]. Clone one per producing thread.
pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T> Producer<T> {
    #[inline]
    pub fn offer(&self, value: T) -> bool {
        self.ring.offer(value)
    }

    #[inline]
    pub fn try_offer(&self, value: T) -> std::result::Result<(), T> {
        self.ring.try_offer(value)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.ring.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Consumer half of a split [`RingBuffer`]. Not cloneable: there is exactly
/// one per buffer.
pub struct Consumer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> Consumer<T> {
    #[inline]
    pub fn poll(&mut self) -> Option<T> {
        // SAFETY: `Consumer` is unique and `&mut self` pins it to one thread.
        unsafe { self.ring.poll_unsync() }
    }

    #[inline]
    pub fn poll_batch(&mut self, dst: &mut Vec<T>, max: usize) -> usize {
        // SAFETY: as above.
        unsafe { self.ring.poll_batch_unsync(dst, max) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.ring.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_basic_offer_poll() {
        let mut rb: RingBuffer<u64> = RingBuffer::new(16).unwrap();

        assert!(rb.is_empty());
        assert!(!rb.is_full());

        assert!(rb.offer(42));
        assert!(!rb.is_empty());
        assert_eq!(rb.size(), 1);

        assert_eq!(rb.poll(), Some(42));
        assert!(rb.is_empty());
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            RingBuffer::<u8>::new(0),
            Err(Error::InvalidCapacity(0))
        ));
        assert!(matches!(
            RingBuffer::<u8>::new(12),
            Err(Error::InvalidCapacity(12))
        ));
        assert!(RingBuffer::<u8>::new(1).is_ok());
    }

    #[test]
    fn test_full_buffer_and_wrap() {
        let mut rb: RingBuffer<u64> = RingBuffer::new(8).unwrap();

        for i in 0..8 {
            assert!(rb.offer(i));
        }
        assert!(rb.is_full());
        assert!(!rb.offer(8)); // Should fail - buffer full
        assert_eq!(rb.size(), 8);

        assert_eq!(rb.poll(), Some(0));
        assert!(rb.offer(8)); // Now should succeed

        for i in 1..=8 {
            assert_eq!(rb.poll(), Some(i));
        }
        assert_eq!(rb.poll(), None);
    }

    #[test]
    fn test_capacity_one_full_and_wrap() {
        let mut rb: RingBuffer<u64> = RingBuffer::new(1).unwrap();
        assert_eq!(rb.capacity(), 1);

        for round in 0..10 {
            assert!(rb.is_empty());
            assert!(rb.offer(round));
            assert!(rb.is_full());
            assert!(!rb.offer(100 + round));
            assert_eq!(rb.size(), 1);

            assert_eq!(rb.poll(), Some(round));
            assert_eq!(rb.poll(), None);
        }
    }

    #[test]
    fn test_capacity_two_full_and_wrap() {
        let mut rb: RingBuffer<u64> = RingBuffer::new(2).unwrap();

        assert!(rb.offer(0));
        assert!(rb.offer(1));
        assert!(rb.is_full());
        assert!(!rb.offer(2));
        assert_eq!(rb.size(), 2);

        assert_eq!(rb.poll(), Some(0));
        assert!(rb.offer(2));
        assert!(!rb.offer(3));

        for i in 1..=2 {
            assert_eq!(rb.poll(), Some(i));
        }
        assert_eq!(rb.poll(), None);

        for round in 0..5 {
            assert!(rb.offer(round * 2));
            assert!(rb.offer(round * 2 + 1));
            assert!(!rb.offer(99));
            assert_eq!(rb.poll(), Some(round * 2));
            assert_eq!(rb.poll(), Some(round * 2 + 1));
        }
    }

    #[test]
    fn test_capacity_one_poll_batch() {
        let mut rb: RingBuffer<u32> = RingBuffer::new(1).unwrap();
        let mut dst = Vec::new();

        for i in 0..4 {
            assert!(rb.offer(i));
            assert!(!rb.offer(i + 10));
            assert_eq!(rb.poll_batch(&mut dst, 8), 1);
        }
        assert_eq!(dst, vec![0, 1, 2, 3]);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_capacity_one_split_across_threads() {
        let (producer, mut consumer) = RingBuffer::<usize>::new(1).unwrap().split();

        let workers: Vec<_> = (0..2)
            .map(|id| {
                let producer = producer.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let mut value = id * 1000 + i;
                        while let Err(back) = producer.try_offer(value) {
                            assert!(producer.size() <= 1);
                            value = back;
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut last = [None::<usize>; 2];
        let mut received = 0;
        while received < 1000 {
            if let Some(v) = consumer.poll() {
                let (id, seq) = (v / 1000, v % 1000);
                if let Some(prev) = last[id] {
                    assert!(seq > prev);
                }
                last[id] = Some(seq);
                received += 1;
            }
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(consumer.poll().is_none());
    }

    #[test]
    fn test_invalid_backoff_is_rejected() {
        let backoff = BackoffConfig::default()
            .park_range(Duration::from_micros(100), Duration::from_micros(10));
        assert!(matches!(
            RingBuffer::<u8>::with_backoff(4, backoff),
            Err(Error::Config(_))
        ));

        let zero = BackoffConfig::default().park_range(Duration::ZERO, Duration::from_micros(10));
        assert!(matches!(
            RingBuffer::<u8>::with_backoff(4, zero),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_rejected_value_is_returned() {
        let rb: RingBuffer<String> = RingBuffer::new(1).unwrap();
        assert!(rb.try_offer("a".into()).is_ok());
        assert_eq!(rb.try_offer("b".into()), Err("b".to_string()));
    }

    #[test]
    fn test_empty_poll_has_no_side_effects() {
        let mut rb: RingBuffer<u64> = RingBuffer::new(4).unwrap();
        assert_eq!(rb.poll(), None);
        assert_eq!(rb.poll(), None);
        assert_eq!(rb.size(), 0);

        assert!(rb.offer(7));
        assert_eq!(rb.poll(), Some(7));
    }

    #[test]
    fn test_wraparound() {
        let mut rb: RingBuffer<u64> = RingBuffer::new(4).unwrap();

        // Fill and drain multiple times to test wraparound
        for round in 0..10 {
            for i in 0..4 {
                assert!(rb.offer(round * 4 + i));
            }
            for i in 0..4 {
                assert_eq!(rb.poll(), Some(round * 4 + i));
            }
        }
    }

    #[test]
    fn test_poll_batch_bounds() {
        let mut rb: RingBuffer<u32> = RingBuffer::new(16).unwrap();
        for i in 0..10 {
            rb.offer(i);
        }

        let mut dst = Vec::new();
        assert_eq!(rb.poll_batch(&mut dst, 4), 4);
        assert_eq!(dst, vec![0, 1, 2, 3]);

        // More requested than available
        assert_eq!(rb.poll_batch(&mut dst, 100), 6);
        assert_eq!(dst, (0..10).collect::<Vec<_>>());

        assert_eq!(rb.poll_batch(&mut dst, 100), 0);
        assert_eq!(rb.poll_batch(&mut dst, 0), 0);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_poll_batch_of_one_matches_poll() {
        let mut a: RingBuffer<u32> = RingBuffer::new(8).unwrap();
        let mut b: RingBuffer<u32> = RingBuffer::new(8).unwrap();

        for round in 0..5 {
            for i in 0..6 {
                a.offer(round * 10 + i);
                b.offer(round * 10 + i);
            }
            let mut batched = Vec::new();
            while a.poll_batch(&mut batched, 1) == 1 {}
            let polled: Vec<u32> = std::iter::from_fn(|| b.poll()).collect();
            assert_eq!(batched, polled);
        }
    }

    #[test]
    fn test_split_across_threads() {
        let (producer, mut consumer) = RingBuffer::<usize>::new(64).unwrap().split();

        let handle = std::thread::spawn(move || {
            for i in 0..1000 {
                while !producer.offer(i) {
                    std::thread::yield_now();
                }
            }
        });

        let mut next = 0;
        while next < 1000 {
            if let Some(v) = consumer.poll() {
                assert_eq!(v, next);
                next += 1;
            }
        }
        handle.join().unwrap();
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_drop_releases_unconsumed_values() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let mut rb: RingBuffer<Counted> = RingBuffer::new(4).unwrap();
            rb.offer(Counted);
            rb.offer(Counted);
            rb.offer(Counted);
            drop(rb.poll());
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }
}
