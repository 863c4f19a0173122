//! Object and buffer recycling.
//!
//! Steady-state generation allocates nothing: every bookkeeping object the
//! runtime creates per request is acquired from a type-keyed free list, and
//! every scratch buffer comes from a length-keyed free list. Entries live
//! until an explicit [`ArenaPool::clear`].

use std::any::{Any, TypeId};
use std::collections::HashMap;

use uuid::Uuid;

/// A recyclable bookkeeping object.
///
/// `reset` must return the value to its construction defaults; a released
/// then reacquired object is indistinguishable from a fresh one.
pub trait Poolable: Default + Send + 'static {
    fn reset(&mut self);
}

/// Identifies the shape family of a scoped buffer pack. Contexts use their
/// plan's graph id, so the `(owner, length)` keys repeat across passes of the
/// same shape and a closed pack's buffers are picked up by the next pass.
/// Never use a per-pass identity here; buffers deposited under a key that is
/// never requested again are stranded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackOwner(pub Uuid);

/// Handle to a buffer checked out from a [`BufferPack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufRef(usize);

/// A scoped pack of scratch buffers.
///
/// Opened against a pool, filled with `acquire` calls over the owner's life,
/// and closed with one [`ArenaPool::close_pack`] that returns every buffer it
/// handed out. Because the pack owns its checkouts, early-return paths cannot
/// leak a buffer past the pack.
#[derive(Default)]
pub struct BufferPack {
    owner: Option<PackOwner>,
    bufs: Vec<(usize, Vec<f32>)>,
}

impl BufferPack {
    pub fn acquire(&mut self, pool: &mut ArenaPool, len: usize) -> BufRef {
        let owner = self.owner.unwrap_or(PackOwner(Uuid::nil()));
        let buf = pool.pack_checkout(owner, len);
        self.bufs.push((len, buf));
        BufRef(self.bufs.len() - 1)
    }

    pub fn get(&self, buf: BufRef) -> &[f32] {
        &self.bufs[buf.0].1
    }

    pub fn get_mut(&mut self, buf: BufRef) -> &mut [f32] {
        &mut self.bufs[buf.0].1
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }
}

/// Type- and shape-keyed free lists for the runtime's recyclable state.
#[derive(Default)]
pub struct ArenaPool {
    objects: HashMap<TypeId, Vec<Box<dyn Any + Send>>>,
    /// Loose buffers keyed by length (context arenas, input snapshots).
    buffers: HashMap<usize, Vec<Vec<f32>>>,
    /// Pack-scoped buffers keyed by (owner, length).
    pack_buffers: HashMap<(PackOwner, usize), Vec<Vec<f32>>>,
}

impl ArenaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop a recycled object of type `T`, or construct a default one.
    pub fn acquire<T: Poolable>(&mut self) -> T {
        let list = self.objects.entry(TypeId::of::<T>()).or_default();
        match list.pop() {
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(value) => *value,
                Err(_) => {
                    // Free lists are keyed by TypeId, so this cannot happen.
                    log::error!("pool free list held a value of the wrong type");
                    T::default()
                }
            },
            None => T::default(),
        }
    }

    /// Reset an object and return it to its free list.
    pub fn release<T: Poolable>(&mut self, mut value: T) {
        value.reset();
        self.objects
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Box::new(value));
    }

    /// Acquire a zeroed f32 buffer of exactly `len` samples.
    pub fn acquire_buffer(&mut self, len: usize) -> Vec<f32> {
        match self.buffers.entry(len).or_default().pop() {
            Some(mut buf) => {
                buf.fill(0.0);
                buf
            }
            None => vec![0.0; len],
        }
    }

    pub fn release_buffer(&mut self, buf: Vec<f32>) {
        self.buffers.entry(buf.len()).or_default().push(buf);
    }

    /// Open a scoped buffer pack for `owner`.
    pub fn open_pack(&mut self, owner: PackOwner) -> BufferPack {
        BufferPack {
            owner: Some(owner),
            bufs: Vec::new(),
        }
    }

    /// Close a pack, returning every buffer it handed out in one call.
    pub fn close_pack(&mut self, pack: BufferPack) {
        let owner = pack.owner.unwrap_or(PackOwner(Uuid::nil()));
        for (len, buf) in pack.bufs {
            self.pack_buffers.entry((owner, len)).or_default().push(buf);
        }
    }

    fn pack_checkout(&mut self, owner: PackOwner, len: usize) -> Vec<f32> {
        match self.pack_buffers.entry((owner, len)).or_default().pop() {
            Some(mut buf) => {
                buf.fill(0.0);
                buf
            }
            None => vec![0.0; len],
        }
    }

    /// Drop every pooled object and buffer. Global teardown only.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.buffers.clear();
        self.pack_buffers.clear();
    }

    /// Number of recycled loose buffers of exactly `len` samples.
    pub fn free_buffers(&self, len: usize) -> usize {
        self.buffers.get(&len).map(|l| l.len()).unwrap_or(0)
    }

    #[cfg(test)]
    fn free_count<T: Poolable>(&self) -> usize {
        self.objects
            .get(&TypeId::of::<T>())
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        cursor: usize,
        items: Vec<u32>,
    }

    impl Poolable for Scratch {
        fn reset(&mut self) {
            self.cursor = 0;
            self.items.clear();
        }
    }

    #[test]
    fn test_round_trip_allocates_one_backing_object() {
        let mut pool = ArenaPool::new();
        for i in 0..100 {
            let mut s: Scratch = pool.acquire();
            s.cursor = i;
            s.items.push(i as u32);
            pool.release(s);
            assert_eq!(pool.free_count::<Scratch>(), 1);
        }
    }

    #[test]
    fn test_reacquired_object_is_reset() {
        let mut pool = ArenaPool::new();
        let mut s: Scratch = pool.acquire();
        s.cursor = 7;
        s.items.extend([1, 2, 3]);
        pool.release(s);

        let s: Scratch = pool.acquire();
        assert_eq!(s.cursor, 0);
        assert!(s.items.is_empty());
    }

    #[test]
    fn test_buffer_reuse_by_length() {
        let mut pool = ArenaPool::new();
        let mut buf = pool.acquire_buffer(81);
        buf[0] = 5.0;
        let ptr = buf.as_ptr();
        pool.release_buffer(buf);

        let buf = pool.acquire_buffer(81);
        assert_eq!(buf.as_ptr(), ptr);
        assert_eq!(buf[0], 0.0);

        let other = pool.acquire_buffer(25);
        assert_ne!(other.len(), 81);
    }

    #[test]
    fn test_pack_returns_all_buffers_on_close() {
        let mut pool = ArenaPool::new();
        let owner = PackOwner(Uuid::new_v4());

        let mut pack = pool.open_pack(owner);
        let a = pack.acquire(&mut pool, 81);
        let b = pack.acquire(&mut pool, 81);
        pack.get_mut(a)[0] = 1.0;
        pack.get_mut(b)[0] = 2.0;
        pool.close_pack(pack);

        assert_eq!(pool.pack_buffers[&(owner, 81)].len(), 2);

        // A pack of the same shape reuses both buffers.
        let mut pack = pool.open_pack(owner);
        pack.acquire(&mut pool, 81);
        pack.acquire(&mut pool, 81);
        assert_eq!(pool.pack_buffers[&(owner, 81)].len(), 0);
        pool.close_pack(pack);
    }
}
