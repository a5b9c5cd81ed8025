//! The circular buffer core and its three handle types.
//!
//! A pipe is implemented as a circular buffer. There are two special cases for
//! this structure: nowrap and wrap.
//!
//! Nowrap:
//!
//! ```text
//!     index 0         begin               end              capacity
//!       [               >==================>                    ]
//! ```
//!
//! In this case the data storage is contiguous. This is the simplest case.
//!
//! Wrap:
//!
//! ```text
//!     index 0       end                 begin                capacity
//!       [============>                    >=====================]
//! ```
//!
//! In this case the data storage is split up, wrapping around to index `0`
//! when it hits `capacity`.
//!
//! Thread-safety: no fancy lock-free tricks are used here. It's a mutex
//! guarding the whole pipe, with a condition variable signaled whenever new
//! elements arrive or the last producer goes away, so blocking consumers can
//! wake up. If you touch the state, you hold the mutex; keep it held for as
//! short as possible.

use std::mem::MaybeUninit;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::config::{PipeConfig, DEFAULT_MINCAP};
use crate::error::PipeError;
use crate::invariants::{
    debug_assert_capacity_bounds, debug_assert_count_matches_cursors,
    debug_assert_cursors_in_bounds, debug_assert_resize_preserves_elements,
};
use crate::metrics::{Metrics, MetricsSnapshot};

/// The mutex-guarded circular buffer state.
struct State<T> {
    buffer: Vec<MaybeUninit<T>>,
    capacity: usize,
    min_cap: usize,
    elem_count: usize,
    begin: usize,
    end: usize,
    producer_refcount: usize,
    consumer_refcount: usize,
}

impl<T> State<T> {
    fn check_invariants(&self) {
        debug_assert_capacity_bounds!(self.capacity, self.min_cap, self.elem_count);
        debug_assert_cursors_in_bounds!(self.begin, self.end, self.capacity);
        debug_assert_count_matches_cursors!(self.begin, self.end, self.capacity, self.elem_count);
    }

    /// Copies the logical contents into a freshly allocated buffer of
    /// `new_cap` elements, flattening any wrap, and adopts it as `self.buffer`.
    ///
    /// Refuses (no-op) if `new_cap` would discard live elements or drop below
    /// `min_cap`.
    fn resize_to(&mut self, new_cap: usize) {
        if new_cap <= self.elem_count || new_cap < self.min_cap {
            return;
        }
        debug_assert_resize_preserves_elements!(new_cap, self.elem_count, self.min_cap);

        let mut new_buffer = Vec::with_capacity(new_cap);
        new_buffer.resize_with(new_cap, MaybeUninit::uninit);

        // SAFETY: every index in the two runs below lies within
        // `[begin, end)` modulo wrap, which is exactly the initialized
        // region of the old buffer (elements between `begin` and `end`,
        // wrapping at `capacity`), and the new buffer has room for all
        // `elem_count` elements starting at index 0.
        unsafe {
            if self.begin <= self.end {
                let len = self.end - self.begin;
                std::ptr::copy_nonoverlapping(
                    self.buffer[self.begin..self.end].as_ptr(),
                    new_buffer.as_mut_ptr(),
                    len,
                );
            } else {
                let first_len = self.capacity - self.begin;
                std::ptr::copy_nonoverlapping(
                    self.buffer[self.begin..].as_ptr(),
                    new_buffer.as_mut_ptr(),
                    first_len,
                );
                std::ptr::copy_nonoverlapping(
                    self.buffer[..self.end].as_ptr(),
                    new_buffer.as_mut_ptr().add(first_len),
                    self.end,
                );
            }
        }

        self.buffer = new_buffer;
        self.capacity = new_cap;
        self.begin = 0;
        self.end = self.elem_count;
        self.check_invariants();
    }

    /// Grows capacity to the next power of two at or above `needed`, if the
    /// buffer is not already big enough.
    fn grow_if_needed(&mut self, needed: usize, metrics: &Metrics) {
        if needed > self.capacity {
            let new_cap = needed.checked_next_power_of_two().unwrap_or(needed);
            trace!(from = self.capacity, to = new_cap, "growing pipe buffer");
            self.resize_to(new_cap);
            metrics.record_grow();
        }
    }

    /// Shrinks capacity by half if occupancy has dropped to a quarter or
    /// below, per the 25%/50% hysteresis rule. No-op if that would violate
    /// `min_cap` or discard elements (`resize_to` enforces both).
    fn shrink_if_sparse(&mut self, metrics: &Metrics) {
        if self.elem_count <= self.capacity / 4
            && self.capacity / 2 >= self.min_cap
            && self.capacity / 2 > self.elem_count
        {
            let new_cap = self.capacity / 2;
            trace!(from = self.capacity, to = new_cap, "shrinking pipe buffer");
            self.resize_to(new_cap);
            metrics.record_shrink();
        }
    }

    /// Advances an index by `n`, wrapping at `capacity`.
    fn advance(&self, index: usize, n: usize) -> usize {
        let advanced = index + n;
        if advanced == self.capacity {
            0
        } else {
            advanced % self.capacity
        }
    }

    fn push_locked(&mut self, items: &[T], metrics: &Metrics)
    where
        T: Copy,
    {
        self.check_invariants();
        if items.is_empty() {
            return;
        }

        self.grow_if_needed(self.elem_count + items.len(), metrics);

        let mut written = 0;
        let mut cursor = self.end;
        while written < items.len() {
            let run = (items.len() - written).min(self.capacity - cursor);
            // SAFETY: `cursor..cursor + run` lies within `[0, capacity)` and
            // does not overlap the live `[begin, end)` region (the grow step
            // above guarantees enough free space for `items.len()` more
            // elements), so writing `MaybeUninit::new` over these slots is
            // sound and does not alias readable data.
            unsafe {
                let dst = self.buffer[cursor..cursor + run].as_mut_ptr();
                std::ptr::copy_nonoverlapping(items[written..written + run].as_ptr(), dst.cast(), run);
            }
            written += run;
            cursor = self.advance(cursor, run);
        }

        self.end = cursor;
        self.elem_count += items.len();
        metrics.record_push(items.len());
        self.check_invariants();
    }

    fn pop_locked(&mut self, dst: &mut [T], metrics: &Metrics) -> usize
    where
        T: Copy,
    {
        self.check_invariants();
        let n = dst.len().min(self.elem_count);

        let mut read = 0;
        let mut cursor = self.begin;
        while read < n {
            let run = (n - read).min(self.capacity - cursor);
            // SAFETY: `cursor..cursor + run` lies within the live
            // `[begin, end)` region, so every slot read here was
            // initialized by a prior `push_locked`.
            unsafe {
                let src = self.buffer[cursor..cursor + run].as_ptr();
                std::ptr::copy_nonoverlapping(src.cast(), dst[read..read + run].as_mut_ptr(), run);
            }
            read += run;
            cursor = self.advance(cursor, run);
        }

        self.begin = cursor;
        self.elem_count -= n;
        metrics.record_pop(n);
        self.check_invariants();

        self.shrink_if_sparse(metrics);
        n
    }

    fn reserve_locked(&mut self, count: usize, metrics: &Metrics) {
        let count = if count == 0 { DEFAULT_MINCAP } else { count };
        self.min_cap = count.max(DEFAULT_MINCAP);
        if count > self.capacity {
            trace!(from = self.capacity, to = count, "reserving pipe buffer");
            self.resize_to(count);
            metrics.record_grow();
        }
    }
}

/// Shared state behind every handle, reached through an `Arc`.
struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    metrics: Metrics,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().expect("pipe mutex poisoned")
    }

    fn push(&self, items: &[T])
    where
        T: Copy,
    {
        let mut state = self.lock();
        state.push_locked(items, &self.metrics);
        drop(state);
        // Broadcast unconditionally, even for an empty slice: a single push
        // of n items may satisfy many waiters each requiring a different
        // count, and skipping the broadcast on a no-op push has no benefit.
        self.not_empty.notify_all();
    }

    fn pop(&self, dst: &mut [T]) -> usize
    where
        T: Copy,
    {
        let mut state = self.lock();
        state = self
            .not_empty
            .wait_while(state, |s| s.elem_count < dst.len() && s.producer_refcount > 0)
            .expect("pipe mutex poisoned");
        if state.elem_count == 0 {
            return 0;
        }
        state.pop_locked(dst, &self.metrics)
    }

    fn pop_eager(&self, dst: &mut [T]) -> usize
    where
        T: Copy,
    {
        let mut state = self.lock();
        state = self
            .not_empty
            .wait_while(state, |s| s.elem_count == 0 && s.producer_refcount > 0)
            .expect("pipe mutex poisoned");
        if state.elem_count == 0 {
            return 0;
        }
        state.pop_locked(dst, &self.metrics)
    }

    fn reserve(&self, count: usize) {
        let mut state = self.lock();
        state.reserve_locked(count, &self.metrics);
    }

    fn len(&self) -> usize {
        self.lock().elem_count
    }

    fn capacity(&self) -> usize {
        self.lock().capacity
    }

    fn is_closed(&self) -> bool {
        self.lock().producer_refcount == 0
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Adds `producer_delta`/`consumer_delta` (each `-1` or `+1`) to the
    /// respective refcount. Broadcasts `not_empty` if the producer count
    /// transitions to zero.
    fn adjust_refcounts(&self, producer_delta: isize, consumer_delta: isize) {
        let mut state = self.lock();
        state.producer_refcount = (state.producer_refcount as isize + producer_delta) as usize;
        state.consumer_refcount = (state.consumer_refcount as isize + consumer_delta) as usize;
        let producer_count = state.producer_refcount;
        drop(state);

        if producer_count == 0 && producer_delta < 0 {
            debug!("last producer released, signaling end-of-stream");
            self.not_empty.notify_all();
        }
    }
}

fn new_shared<T>(config: PipeConfig) -> Result<Arc<Shared<T>>, PipeError> {
    if std::mem::size_of::<T>() == 0 {
        return Err(PipeError::ZeroSizedElement);
    }

    let mut buffer = Vec::new();
    buffer.try_reserve_exact(DEFAULT_MINCAP)?;
    buffer.resize_with(DEFAULT_MINCAP, MaybeUninit::uninit);

    let state = State {
        buffer,
        capacity: DEFAULT_MINCAP,
        min_cap: DEFAULT_MINCAP,
        elem_count: 0,
        begin: 0,
        end: 0,
        producer_refcount: 1,
        consumer_refcount: 1,
    };

    let metrics = Metrics::new(config.enable_metrics);

    Ok(Arc::new(Shared {
        state: Mutex::new(state),
        not_empty: Condvar::new(),
        metrics,
    }))
}

/// The constructor handle for a pipe.
///
/// Created by [`Pipe::new`] (or [`Pipe::with_config`]); counts as one producer
/// and one consumer until dropped. Mints additional [`Producer`] and
/// [`Consumer`] handles via [`Pipe::producer`]/[`Pipe::consumer`].
pub struct Pipe<T> {
    inner: Arc<Shared<T>>,
}

/// A handle that permits pushing elements onto a pipe.
pub struct Producer<T> {
    inner: Arc<Shared<T>>,
}

/// A handle that permits popping elements from a pipe.
pub struct Consumer<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Pipe<T> {
    /// Creates a new pipe with metrics disabled, initial capacity
    /// [`DEFAULT_MINCAP`](crate::config::DEFAULT_MINCAP).
    ///
    /// Fails if `T` is zero-sized or the initial allocation fails.
    pub fn new() -> Result<Self, PipeError> {
        Self::with_config(PipeConfig::default())
    }

    /// Creates a new pipe with the given [`PipeConfig`].
    pub fn with_config(config: PipeConfig) -> Result<Self, PipeError> {
        Ok(Self { inner: new_shared(config)? })
    }

    /// Mints a new producer handle sharing this pipe's state.
    pub fn producer(&self) -> Producer<T> {
        self.inner.adjust_refcounts(1, 0);
        Producer { inner: Arc::clone(&self.inner) }
    }

    /// Mints a new consumer handle sharing this pipe's state.
    pub fn consumer(&self) -> Consumer<T> {
        self.inner.adjust_refcounts(0, 1);
        Consumer { inner: Arc::clone(&self.inner) }
    }

    /// Sets the minimum capacity, growing the buffer immediately if it is
    /// currently smaller (and doing so would not discard live elements).
    /// `count == 0` resets the minimum to the default.
    pub fn reserve(&self, count: usize) {
        self.inner.reserve(count);
    }

    /// Current number of enqueued elements.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no enqueued elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current buffer capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Returns `true` once the last producer handle has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// A snapshot of this pipe's push/pop/resize counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics()
    }
}

impl<T> Drop for Pipe<T> {
    fn drop(&mut self) {
        // The constructor handle represents one share of each role.
        self.inner.adjust_refcounts(-1, -1);
    }
}

// SAFETY: all access to the shared buffer goes through `Shared::state`'s
// mutex; `Pipe<T>` carries no unsynchronized interior mutability of its own.
unsafe impl<T: Send> Send for Pipe<T> {}
unsafe impl<T: Send> Sync for Pipe<T> {}

impl<T> Producer<T> {
    /// Appends `items` to the tail of the pipe.
    ///
    /// An empty slice is a no-op (the wake-up broadcast still happens).
    pub fn push(&self, items: &[T])
    where
        T: Copy,
    {
        self.inner.push(items);
    }

    /// Sets the pipe's minimum capacity; see [`Pipe::reserve`].
    pub fn reserve(&self, count: usize) {
        self.inner.reserve(count);
    }

    /// Current number of enqueued elements.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no enqueued elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the pipe's push/pop/resize counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics()
    }
}

impl<T> Clone for Producer<T> {
    /// Mints a sibling producer handle, incrementing the producer refcount.
    fn clone(&self) -> Self {
        self.inner.adjust_refcounts(1, 0);
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.inner.adjust_refcounts(-1, 0);
    }
}

unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Sync for Producer<T> {}

impl<T> Consumer<T> {
    /// Removes exactly `dst.len()` elements into `dst`, blocking until that
    /// many are available or every producer handle has been dropped.
    ///
    /// Returns the number of elements actually written, which is less than
    /// `dst.len()` only at end-of-stream.
    pub fn pop(&self, dst: &mut [T]) -> usize
    where
        T: Copy,
    {
        self.inner.pop(dst)
    }

    /// Removes up to `dst.len()` elements into `dst`, blocking only until at
    /// least one is available or every producer handle has been dropped.
    ///
    /// May return fewer than `dst.len()` elements even while producers remain.
    pub fn pop_eager(&self, dst: &mut [T]) -> usize
    where
        T: Copy,
    {
        self.inner.pop_eager(dst)
    }

    /// Sets the pipe's minimum capacity; see [`Pipe::reserve`].
    pub fn reserve(&self, count: usize) {
        self.inner.reserve(count);
    }

    /// Current number of enqueued elements.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no enqueued elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the last producer handle has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// A snapshot of the pipe's push/pop/resize counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics()
    }
}

impl<T> Clone for Consumer<T> {
    /// Mints a sibling consumer handle, incrementing the consumer refcount.
    fn clone(&self) -> Self {
        self.inner.adjust_refcounts(0, 1);
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.inner.adjust_refcounts(0, -1);
    }
}

unsafe impl<T: Send> Send for Consumer<T> {}
unsafe impl<T: Send> Sync for Consumer<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_rejects_zero_sized_element() {
        let result = Pipe::<()>::new();
        assert!(matches!(result, Err(PipeError::ZeroSizedElement)));
    }

    #[test]
    fn s1_single_push_exact_pop() {
        let pipe = Pipe::<u32>::new().unwrap();
        let producer = pipe.producer();
        let consumer = pipe.consumer();

        producer.push(&[1, 2, 3, 4, 5]);

        let mut dst = [0u32; 5];
        assert_eq!(consumer.pop(&mut dst), 5);
        assert_eq!(dst, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn s2_eager_pop_across_two_pushes() {
        let pipe = Pipe::<u8>::new().unwrap();
        let producer = pipe.producer();
        let consumer = pipe.consumer();

        producer.push(b"abc");
        producer.push(b"de");

        let mut dst = [0u8; 10];
        let n = consumer.pop_eager(&mut dst);
        assert_eq!(n, 5);
        assert_eq!(&dst[..5], b"abcde");
    }

    #[test]
    fn s3_shrink_returns_to_min_cap() {
        let pipe = Pipe::<u8>::new().unwrap();
        pipe.reserve(4);
        let producer = pipe.producer();
        let consumer = pipe.consumer();

        producer.push(&[0u8; 10]);
        let mut dst = [0u8; 10];
        assert_eq!(consumer.pop(&mut dst), 10);

        // One pop only halves once (elem_count 10 -> 0 makes 16 sparse, so it
        // drops to 8); it takes another sparse pop to reach min_cap.
        assert_eq!(pipe.capacity(), 8);

        producer.push(&[0u8; 1]);
        consumer.pop(&mut dst[..1]);
        assert_eq!(pipe.capacity(), 4);
    }

    #[test]
    fn s4_end_of_stream_after_producer_drop() {
        let pipe = Pipe::<[u8; 8]>::new().unwrap();
        let producer = pipe.producer();
        let consumer = pipe.consumer();

        for i in 0..1000u32 {
            producer.push(&[[i as u8; 8]]);
        }
        drop(producer);

        let mut dst = vec![[0u8; 8]; 2000];
        assert_eq!(consumer.pop(&mut dst), 1000);

        let mut dst2 = [[0u8; 8]; 1];
        assert_eq!(consumer.pop(&mut dst2), 0);
    }

    #[test]
    fn s5_forced_wrap_round_trip() {
        let pipe = Pipe::<u32>::new().unwrap();
        pipe.reserve(8);
        let producer = pipe.producer();
        let consumer = pipe.consumer();

        let first: Vec<u32> = (0..6).collect();
        producer.push(&first);

        let mut drained = [0u32; 4];
        assert_eq!(consumer.pop(&mut drained), 4);
        assert_eq!(drained, [0, 1, 2, 3]);

        let second: Vec<u32> = (6..11).collect();
        producer.push(&second);

        let mut rest = [0u32; 7];
        assert_eq!(consumer.pop(&mut rest), 7);
        assert_eq!(rest, [4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn push_empty_slice_is_a_no_op() {
        let pipe = Pipe::<u32>::new().unwrap();
        let producer = pipe.producer();
        producer.push(&[]);
        assert_eq!(pipe.len(), 0);
    }

    #[test]
    fn pop_empty_slice_does_not_block() {
        let pipe = Pipe::<u32>::new().unwrap();
        let producer = pipe.producer();
        let consumer = pipe.consumer();
        producer.push(&[1, 2, 3]);
        let mut dst: [u32; 0] = [];
        assert_eq!(consumer.pop(&mut dst), 0);
    }

    #[test]
    fn reserve_is_idempotent() {
        let pipe = Pipe::<u32>::new().unwrap();
        pipe.reserve(64);
        let cap_after_first = pipe.capacity();
        pipe.reserve(64);
        assert_eq!(pipe.capacity(), cap_after_first);
    }

    #[test]
    fn metrics_track_conservation() {
        let pipe = Pipe::with_config(PipeConfig::default().with_metrics(true)).unwrap();
        let producer = pipe.producer();
        let consumer = pipe.consumer();

        producer.push(&[1u32, 2, 3, 4]);
        let mut dst = [0u32; 3];
        consumer.pop(&mut dst);

        let snapshot = pipe.metrics();
        assert_eq!(snapshot.items_pushed, 4);
        assert_eq!(snapshot.items_popped, 3);
        assert_eq!(snapshot.items_pushed - snapshot.items_popped, pipe.len() as u64);
    }

    #[test]
    fn cloning_producer_increments_refcount_independently() {
        let pipe = Pipe::<u32>::new().unwrap();
        let producer = pipe.producer();
        let producer2 = producer.clone();
        let consumer = pipe.consumer();

        drop(producer);
        producer2.push(&[7]);

        let mut dst = [0u32; 1];
        assert_eq!(consumer.pop(&mut dst), 1);
        assert_eq!(dst, [7]);
    }
}
