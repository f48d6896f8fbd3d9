//! An asynchronous [readers-writer lock].
//!
//! See the documentation for the [`RwLock`] type for details.
//!
//! [readers-writer lock]: https://en.wikipedia.org/wiki/Readers%E2%80%93writer_lock
use crate::{
    loom::{
        cell::UnsafeCell,
        sync::{
            atomic::{AtomicIsize, Ordering::*},
            Mutex,
        },
    },
    mutex::RawMutex,
    semaphore::{Acquire, Semaphore},
};
use core::{
    fmt,
    future::Future,
    ops::{Deref, DerefMut},
    pin::Pin,
    task::{Context, Poll},
};


/// The reader count is biased by this much while a writer holds or is
/// acquiring the lock, which drives it negative.
const MAX_READERS: isize = 1 << 30;

/// A readers-writer lock that protects no data.
///
/// Any number of readers may hold the lock at once, or a single writer. A
/// writer that is waiting for readers to leave blocks new readers from
/// entering, so a steady stream of readers cannot starve it.
///
/// Writers exclude each other with a [`RawMutex`]. Readers are counted in a
/// signed counter: a writer subtracts a large bias from it, so a reader that
/// observes a negative count knows a writer is present and parks on the
/// reader semaphore. The writer records how many readers were active when it
/// arrived, and the last of those to leave wakes it.
///
/// # Cancel safety
///
/// [`read`](Self::read) and [`write`](Self::write) may be dropped while they
/// are parked, for example when the task awaiting them is canceled.
///
/// A dropped reader that had not been admitted yet is uncounted. One that
/// was admitted, but never observed it, releases its read lock at once.
///
/// A dropped writer that was still waiting for readers to leave cannot take
/// back its announcement, since the readers it was waiting on are already
/// counting down towards it. Instead, the last of them unlocks on the
/// writer's behalf, admitting the readers that queued behind it. A writer
/// that was dropped after the last reader woke it unlocks immediately.
pub struct RawRwLock {
    w: RawMutex,
    writer_sem: Semaphore,
    reader_sem: Semaphore,
    reader_count: AtomicIsize,
    reader_wait: AtomicIsize,
    /// Serializes handing the lock over with parked readers and writers
    /// giving up. Set while the writer the active readers are draining
    /// towards has been dropped.
    handoff: Mutex<bool>,
}

/// A reader parked behind a writer.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
struct ParkedReader<'lock> {
    lock: &'lock RawRwLock,
    acquire: Acquire<'lock>,
    admitted: bool,
}

/// A writer waiting for the readers that were active when it arrived.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
struct ParkedWriter<'lock> {
    lock: &'lock RawRwLock,
    acquire: Acquire<'lock>,
    locked: bool,
}

/// An asynchronous readers-writer lock protecting a value of type `T`.
///
/// # Examples
///
/// ```
/// use offset_sync::RwLock;
/// # tokio_test::block_on(async {
///
/// let lock = RwLock::new(5);
/// {
///     let r1 = lock.read().await;
///     let r2 = lock.read().await;
///     assert_eq!(*r1 + *r2, 10);
/// }
/// *lock.write().await += 1;
/// assert_eq!(*lock.read().await, 6);
/// # });
/// ```
pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

/// An RAII guard granting shared read access to the value in a [`RwLock`].
#[must_use = "if unused, the `RwLock` will immediately unlock"]
pub struct RwLockReadGuard<'lock, T: ?Sized> {
    lock: &'lock RwLock<T>,
}

/// An RAII guard granting exclusive write access to the value in a
/// [`RwLock`].
#[must_use = "if unused, the `RwLock` will immediately unlock"]
pub struct RwLockWriteGuard<'lock, T: ?Sized> {
    lock: &'lock RwLock<T>,
}

// === impl RawRwLock ===

impl RawRwLock {
    /// Returns a new, unlocked `RawRwLock`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            w: RawMutex::new(),
            writer_sem: Semaphore::new(0),
            reader_sem: Semaphore::new(0),
            reader_count: AtomicIsize::new(0),
            reader_wait: AtomicIsize::new(0),
            handoff: Mutex::new(false),
        }
    }

    /// Locks for reading, waiting while a writer holds or is acquiring the
    /// lock.
    pub async fn read(&self) {
        if test_dbg!(self.reader_count.fetch_add(1, AcqRel) + 1) < 0 {
            // a writer is pending; it will release us when it unlocks
            ParkedReader {
                lock: self,
                acquire: self.reader_sem.acquire(),
                admitted: false,
            }
            .await;
        }
    }

    /// Locks for reading without waiting.
    ///
    /// Returns `true` if a read lock was acquired.
    #[must_use]
    pub fn try_read(&self) -> bool {
        let mut count = self.reader_count.load(Acquire);
        loop {
            if count < 0 {
                return false;
            }
            match self
                .reader_count
                .compare_exchange_weak(count, count + 1, AcqRel, Acquire)
            {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Releases a read lock.
    ///
    /// # Panics
    ///
    /// If the lock is not held for reading.
    #[track_caller]
    pub fn read_unlock(&self) {
        let count = test_dbg!(self.reader_count.fetch_sub(1, AcqRel) - 1);
        if count >= 0 {
            return;
        }

        if count + 1 == 0 || count + 1 == -MAX_READERS {
            panic!("read_unlock of unlocked RwLock");
        }

        // a writer is waiting; the last reader it was waiting on wakes it
        if self.reader_wait.fetch_sub(1, AcqRel) - 1 == 0 {
            self.wake_writer();
        }
    }

    fn wake_writer(&self) {
        let mut writer_dropped = self.handoff.lock();
        if !*writer_dropped {
            self.writer_sem.release();
            return;
        }

        *writer_dropped = false;
        drop(writer_dropped);
        test_trace!("RawRwLock::wake_writer -> unlocking for a dropped writer");
        self.write_unlock();
    }

    /// Locks for writing, waiting until no other writer holds the lock and
    /// every active reader has left.
    pub async fn write(&self) {
        self.w.lock().await;

        // announce the writer; the old count is the number of active readers
        let readers = test_dbg!(self.reader_count.fetch_sub(MAX_READERS, AcqRel));
        if readers != 0 && self.reader_wait.fetch_add(readers, AcqRel) + readers != 0 {
            ParkedWriter {
                lock: self,
                acquire: self.writer_sem.acquire(),
                locked: false,
            }
            .await;
        }
    }

    /// Locks for writing without waiting.
    ///
    /// Returns `true` if the write lock was acquired.
    #[must_use]
    pub fn try_write(&self) -> bool {
        if !self.w.try_lock() {
            return false;
        }

        if self
            .reader_count
            .compare_exchange(0, -MAX_READERS, AcqRel, Acquire)
            .is_err()
        {
            self.w.unlock();
            return false;
        }

        true
    }

    /// Releases the write lock, admitting every reader that queued up behind
    /// it.
    ///
    /// # Panics
    ///
    /// If the lock is not held for writing.
    #[track_caller]
    pub fn write_unlock(&self) {
        let handoff = self.handoff.lock();
        let readers = test_dbg!(self.reader_count.fetch_add(MAX_READERS, AcqRel) + MAX_READERS);
        if readers >= MAX_READERS {
            panic!("write_unlock of unlocked RwLock");
        }

        for _ in 0..readers {
            self.reader_sem.release();
        }
        drop(handoff);
        self.w.unlock();
    }

    /// Returns `true` if the lock is held for writing (or a writer is waiting
    /// for readers to leave).
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.reader_count.load(Acquire) < 0
    }

    /// Returns the number of readers holding or waiting for the lock.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        let count = self.reader_count.load(Acquire);
        let count = if count < 0 { count + MAX_READERS } else { count };
        count as usize
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRwLock")
            .field("writer", &self.is_write_locked())
            .field("readers", &self.reader_count())
            .field("reader_wait", &self.reader_wait.load(Relaxed))
            .finish()
    }
}

// === impl ParkedReader ===

impl Future for ParkedReader<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if Pin::new(&mut this.acquire).poll(cx).is_pending() {
            return Poll::Pending;
        }
        this.admitted = true;
        Poll::Ready(())
    }
}

impl Drop for ParkedReader<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }

        let handoff = self.lock.handoff.lock();
        if self.acquire.cancel() {
            drop(handoff);
            test_trace!("ParkedReader::drop -> releasing an unobserved read lock");
            self.lock.read_unlock();
            return;
        }

        // the writer has not unlocked yet, so this reader is still one of
        // the ones it will admit.
        test_trace!("ParkedReader::drop -> uncounting");
        self.lock.reader_count.fetch_sub(1, AcqRel);
        drop(handoff);
    }
}

// === impl ParkedWriter ===

impl Future for ParkedWriter<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if Pin::new(&mut this.acquire).poll(cx).is_pending() {
            return Poll::Pending;
        }
        this.locked = true;
        Poll::Ready(())
    }
}

impl Drop for ParkedWriter<'_> {
    fn drop(&mut self) {
        if self.locked {
            return;
        }

        let mut writer_dropped = self.lock.handoff.lock();
        if self.acquire.cancel() {
            drop(writer_dropped);
            test_trace!("ParkedWriter::drop -> releasing an unobserved write lock");
            self.lock.write_unlock();
            return;
        }

        test_trace!("ParkedWriter::drop -> last reader will unlock");
        *writer_dropped = true;
    }
}

// === impl RwLock ===

impl<T> RwLock<T> {
    /// Returns a new, unlocked `RwLock` protecting `data`.
    #[must_use]
    pub fn new(data: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Locks this `RwLock` for shared read access.
    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.read().await;
        RwLockReadGuard { lock: self }
    }

    /// Locks this `RwLock` for exclusive write access.
    pub async fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.write().await;
        RwLockWriteGuard { lock: self }
    }

    /// Attempts to lock for reading without waiting.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.raw.try_read().then(|| RwLockReadGuard { lock: self })
    }

    /// Attempts to lock for writing without waiting.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.raw.try_write().then(|| RwLockWriteGuard { lock: self })
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

// === impl RwLockReadGuard ===

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: no writer can exist while a read guard is held.
        self.lock.data.with(|data| unsafe { &*data })
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.read_unlock()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

// === impl RwLockWriteGuard ===

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: the write guard is exclusive.
        self.lock.data.with(|data| unsafe { &*data })
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the write guard is exclusive.
        self.lock.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.write_unlock()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}
