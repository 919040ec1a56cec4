//! Purpose: Reuse expensive per-request instances (decoders, char scratch buffers).
//! Exports: `PoolPolicy`, `ObjectPool`, `Pooled`, `CharArrayPool`, `ScratchBufferPool`.
//! Role: Shared arenas borrowed for exactly one request at a time.
//! Invariants: A borrowed instance is owned by one borrower until its guard drops.
//! Invariants: Pools never hold request-scoped data; policies decide what is retained.
//! Invariants: Returning an absent scratch buffer is a no-op.
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Construction and return policy for an [`ObjectPool`].
pub trait PoolPolicy<T>: Send + Sync {
    fn create(&self) -> T;

    /// Called on every return; `false` drops the instance instead of retaining it.
    fn recycle(&self, item: &mut T) -> bool;
}

pub struct ObjectPool<T, P> {
    policy: P,
    idle: Mutex<Vec<T>>,
    outstanding: AtomicUsize,
    created: AtomicUsize,
}

impl<T, P: PoolPolicy<T>> ObjectPool<T, P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> Pooled<'_, T, P> {
        let reused = self.lock_idle().pop();
        let item = match reused {
            Some(item) => item,
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                self.policy.create()
            }
        };
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Pooled {
            pool: self,
            item: Some(item),
        }
    }

    fn release(&self, mut item: T) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.policy.recycle(&mut item) {
            self.lock_idle().push(item);
        }
    }

    /// Instances currently borrowed and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.lock_idle().len()
    }

    /// Total instances built by the policy over the pool's lifetime.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Borrow guard; the instance goes back to its pool when the guard drops.
pub struct Pooled<'a, T, P: PoolPolicy<T>> {
    pool: &'a ObjectPool<T, P>,
    item: Option<T>,
}

impl<T, P: PoolPolicy<T>> Pooled<'_, T, P> {
    /// Return the instance now rather than at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl<T, P: PoolPolicy<T>> Deref for Pooled<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until drop")
    }
}

impl<T, P: PoolPolicy<T>> DerefMut for Pooled<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until drop")
    }
}

impl<T, P: PoolPolicy<T>> Drop for Pooled<'_, T, P> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

const MIN_BUCKET_LEN: usize = 16;
const BUCKET_COUNT: usize = 17;
const DEFAULT_RETAINED_PER_BUCKET: usize = 32;

/// Fixed-size char array pool: power-of-two buckets from 16 to 1Mi chars.
/// Requests above the largest bucket are allocated exactly and never retained.
pub struct CharArrayPool {
    buckets: Vec<Mutex<Vec<Vec<char>>>>,
    retained_per_bucket: usize,
}

impl CharArrayPool {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_PER_BUCKET)
    }

    pub fn with_retention(retained_per_bucket: usize) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            buckets,
            retained_per_bucket,
        }
    }

    /// Rent an array of at least `minimum_length` chars. Contents are unspecified.
    pub fn rent(&self, minimum_length: usize) -> Vec<char> {
        let Some(index) = bucket_index(minimum_length) else {
            return vec!['\0'; minimum_length];
        };
        let reused = self.lock_bucket(index).pop();
        reused.unwrap_or_else(|| vec!['\0'; bucket_len(index)])
    }

    pub fn give_back(&self, array: Vec<char>) {
        let len = array.len();
        if !len.is_power_of_two() {
            return;
        }
        let Some(index) = bucket_index(len) else {
            return;
        };
        if bucket_len(index) != len {
            return;
        }
        let mut bucket = self.lock_bucket(index);
        if bucket.len() < self.retained_per_bucket {
            bucket.push(array);
        }
    }

    pub fn retained(&self) -> usize {
        (0..BUCKET_COUNT).map(|index| self.lock_bucket(index).len()).sum()
    }

    fn lock_bucket(&self, index: usize) -> MutexGuard<'_, Vec<Vec<char>>> {
        self.buckets[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CharArrayPool {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_index(minimum_length: usize) -> Option<usize> {
    let len = minimum_length
        .max(MIN_BUCKET_LEN)
        .checked_next_power_of_two()?;
    let index = (len.trailing_zeros() - MIN_BUCKET_LEN.trailing_zeros()) as usize;
    (index < BUCKET_COUNT).then_some(index)
}

fn bucket_len(index: usize) -> usize {
    MIN_BUCKET_LEN << index
}

/// Scratch buffers for the tokenizer, backed by a shared [`CharArrayPool`].
pub struct ScratchBufferPool {
    chars: Arc<CharArrayPool>,
    outstanding: AtomicUsize,
}

impl ScratchBufferPool {
    pub fn new(chars: Arc<CharArrayPool>) -> Self {
        Self {
            chars,
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn rent(&self, minimum_length: usize) -> Vec<char> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.chars.rent(minimum_length)
    }

    pub fn return_buffer(&self, buffer: Option<Vec<char>>) {
        let Some(buffer) = buffer else {
            return;
        };
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        self.chars.give_back(buffer);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn chars(&self) -> &CharArrayPool {
        &self.chars
    }
}

impl Default for ScratchBufferPool {
    fn default() -> Self {
        Self::new(Arc::new(CharArrayPool::new()))
    }
}
