//! Pooling contract for the scanner/entry/message/writer types.
//!
//! Every pooled type implements [`Reset`] instead of [`Default`] because the
//! intent is narrower than "give me a fresh value": a pooled instance must
//! be returned to a *zeroed* state, even though its backing allocation is
//! reused. Pools are built on `object_pool::Pool`, the same crate the rest
//! of this workspace reaches for buffer pooling.

use object_pool::{Pool, Reusable};

/// Implemented by every type that can live in a pool: `reset` clears all
/// fields so the next acquirer never observes stale data.
pub trait Reset {
    fn reset(&mut self);
}

/// A pool of `T` that resets instances on release instead of on acquire,
/// matching the source library's "release clears, acquire hands out
/// whatever was last released" convention.
pub struct ResetPool<T: Reset + Default> {
    inner: Pool<T>,
}

impl<T: Reset + Default> ResetPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Pool::new(capacity, T::default),
        }
    }

    pub fn acquire(&self) -> Reusable<'_, T> {
        self.inner.try_pull().unwrap_or_else(|| {
            Reusable::new(&self.inner, T::default())
        })
    }

    pub fn release(&self, mut item: Reusable<'_, T>) {
        item.reset();
        // Dropping `item` returns it to the pool.
    }

    /// Like [`Self::acquire`], but detaches the instance from the pool's
    /// borrow-tied `Reusable` wrapper so it can be moved across task
    /// boundaries (a [`Reusable`] can't outlive the `&self` it borrows,
    /// which a value handed off to a spawned worker task must be able to
    /// do). Pair with [`Self::release_owned`] once the caller is done with it.
    pub fn acquire_owned(&self) -> T {
        match self.inner.try_pull() {
            Some(reusable) => reusable.detach().1,
            None => T::default(),
        }
    }

    /// Resets `item` and returns it to the pool. The `Self::acquire_owned`/
    /// `Self::release_owned` pair is what `agent-spop`'s frame read loop and
    /// worker pool use, since a frame is acquired on the read task and
    /// released on whichever worker task finishes processing it.
    pub fn release_owned(&self, mut item: T) {
        item.reset();
        self.inner.attach(item);
    }
}
