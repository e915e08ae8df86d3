//! # Buddy Engine
//!
//! One split/coalesce algorithm shared by the physical page allocator and the
//! kmalloc heap. Blocks are named by an *index* in arena units (frame numbers
//! for physical memory, byte offsets for the heap) and have an *order*: a
//! block of order `k` spans `1 << k` units and starts at an index that is a
//! multiple of `1 << k`.
//!
//! ```text
//! order 2   [0 1 2 3]                   [4 5 6 7]
//! order 1   [0 1] [2 3]                 [4 5] [6 7]
//!               └─ buddy_of(0, 1) = 2       └─ split_partner(4, 2) = 6
//! ```
//!
//! [`FreeAreas`] owns the per-order list heads; the arena owns the per-block
//! metadata (order, "on a free list", links), so the lists are intrusive in
//! whatever the arena uses as block descriptors.

use crate::error::BuddyError;
use log::trace;

/// Upper bound on the number of orders any arena may use.
pub const MAX_ORDERS: usize = 32;

/// Per-block state the buddy engine reads and writes through an [`Arena`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockMeta {
    pub order: u8,
    /// On a free list. Only then are `prev` and `next` meaningful.
    pub linked: bool,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

/// Storage the buddy engine runs over.
pub trait Arena {
    /// Number of orders; valid orders are `0..order_count()`.
    fn order_count(&self) -> usize;

    /// Address of the unit at `index`.
    fn address_of(&self, index: usize) -> u64;

    /// Index of the unit containing `address`.
    fn index_of(&self, address: u64) -> usize;

    /// Metadata of the block starting at `index`, or `None` if the arena has no
    /// such block (outside the arena, not backed yet).
    fn block(&self, index: usize) -> Option<BlockMeta>;

    fn set_block(&mut self, index: usize, meta: BlockMeta);

    /// Whether two blocks may ever be merged (same zone, same heap).
    fn same_group(&self, a: usize, b: usize) -> bool;
}

/// The other half of the order-`order + 1` block containing `index`.
#[inline]
#[must_use]
pub const fn buddy_of(index: usize, order: usize) -> usize {
    index ^ (1 << order)
}

/// Upper half created when the order-`order` block at `index` is split.
#[inline]
#[must_use]
pub const fn split_partner(index: usize, order: usize) -> usize {
    index | (1 << (order - 1))
}

/// Lower of the two buddies at `order`; the one that heads the merged block.
#[inline]
#[must_use]
pub const fn primary_of(index: usize, order: usize) -> usize {
    index & !(1 << order)
}

/// Smallest order whose block holds `bytes` plus `header` bytes, never below `min_order`.
///
/// `None` if the sum does not fit a `usize`.
///
/// ```rust
/// # use kernel_alloc::buddy::order_for;
/// assert_eq!(order_for(100, 16, 5), Some(7));
/// assert_eq!(order_for(1, 16, 5), Some(5));
/// assert_eq!(order_for(4096, 0, 0), Some(12));
/// assert_eq!(order_for(usize::MAX, 16, 5), None);
/// ```
#[must_use]
pub const fn order_for(bytes: usize, header: usize, min_order: usize) -> Option<usize> {
    let Some(total) = bytes.checked_add(header) else {
        return None;
    };
    let order = if total <= 1 {
        0
    } else {
        (usize::BITS - (total - 1).leading_zeros()) as usize
    };
    Some(if order < min_order { min_order } else { order })
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn order_byte(order: usize) -> u8 {
    debug_assert!(order < MAX_ORDERS);
    order as u8
}

#[derive(Copy, Clone, Debug, Default)]
struct FreeList {
    head: Option<usize>,
    count: usize,
}

/// Per-order free lists of one arena (or zone).
#[derive(Debug)]
pub struct FreeAreas {
    lists: [FreeList; MAX_ORDERS],
    orders: usize,
}

impl FreeAreas {
    /// Empty lists for orders `0..orders`.
    #[must_use]
    pub const fn new(orders: usize) -> Self {
        assert!(orders > 0 && orders <= MAX_ORDERS);
        Self {
            lists: [FreeList { head: None, count: 0 }; MAX_ORDERS],
            orders,
        }
    }

    #[must_use]
    pub const fn order_count(&self) -> usize {
        self.orders
    }

    /// Largest valid order.
    #[must_use]
    pub const fn max_order(&self) -> usize {
        self.orders - 1
    }

    /// Blocks on the list of `order`.
    #[must_use]
    pub const fn count(&self, order: usize) -> usize {
        self.lists[order].count
    }

    /// Block count per order.
    #[must_use]
    pub fn counts(&self) -> [usize; MAX_ORDERS] {
        let mut out = [0; MAX_ORDERS];
        for (o, list) in self.lists.iter().take(self.orders).enumerate() {
            out[o] = list.count;
        }
        out
    }

    /// Units held by all free blocks.
    #[must_use]
    pub fn free_units(&self) -> u64 {
        self.lists
            .iter()
            .take(self.orders)
            .enumerate()
            .map(|(o, l)| (l.count as u64) << o)
            .sum()
    }

    /// Removes a block of at least `order`, splitting it down to exactly `order`.
    ///
    /// Upper halves produced by the splits go onto the lists one order below
    /// the block they came from.
    ///
    /// # Errors
    /// - [`BuddyError::OrderTooLarge`] before any list is looked at.
    /// - [`BuddyError::OutOfMemory`] if no list at or above `order` has a block.
    pub fn find<A: Arena + ?Sized>(&mut self, arena: &mut A, order: usize) -> Result<usize, BuddyError> {
        debug_assert_eq!(arena.order_count(), self.orders);
        if order >= self.orders {
            return Err(BuddyError::OrderTooLarge {
                order,
                max: self.max_order(),
            });
        }

        let Some(found) = (order..self.orders).find(|&o| self.lists[o].head.is_some()) else {
            return Err(BuddyError::OutOfMemory { order });
        };
        let index = self.lists[found].head.ok_or(BuddyError::OutOfMemory { order })?;
        self.unlink(arena, index, found);

        let mut current = found;
        while current > order {
            let upper = split_partner(index, current);
            current -= 1;
            self.push(arena, upper, current);
        }
        arena.set_block(
            index,
            BlockMeta {
                order: order_byte(order),
                ..BlockMeta::default()
            },
        );
        trace!("buddy: found order {order} at {index:#x} (split from {found})");
        Ok(index)
    }

    /// Returns the block at `index` of `order` and merges it with free buddies.
    ///
    /// Returns the index of the block finally placed on a list, which is the
    /// lowest index of everything merged.
    pub fn insert<A: Arena + ?Sized>(&mut self, arena: &mut A, index: usize, order: usize) -> usize {
        debug_assert_eq!(arena.order_count(), self.orders);
        debug_assert!(order < self.orders);
        debug_assert_eq!(index & ((1 << order) - 1), 0, "block not aligned to its order");

        let mut index = index;
        let mut order = order;
        while order < self.max_order() {
            let buddy = buddy_of(index, order);
            let mergeable = matches!(
                arena.block(buddy),
                Some(meta) if meta.linked && usize::from(meta.order) == order
            ) && arena.same_group(index, buddy);
            if !mergeable {
                break;
            }
            self.unlink(arena, buddy, order);
            index = primary_of(index, order);
            order += 1;
        }
        self.push(arena, index, order);
        index
    }

    /// Takes a specific free block off its list.
    ///
    /// # Panics
    /// If the block is not on a free list.
    pub fn remove<A: Arena + ?Sized>(&mut self, arena: &mut A, index: usize) -> usize {
        let meta = arena.block(index).filter(|m| m.linked);
        let Some(meta) = meta else {
            log::error!("buddy: block {index:#x} is not on a free list");
            panic!("buddy: remove of unlinked block {index:#x}");
        };
        let order = usize::from(meta.order);
        self.unlink(arena, index, order);
        order
    }

    /// Address-level wrapper around [`find`](Self::find).
    ///
    /// # Errors
    /// As [`find`](Self::find).
    pub fn find_address<A: Arena + ?Sized>(&mut self, arena: &mut A, order: usize) -> Result<u64, BuddyError> {
        let index = self.find(arena, order)?;
        Ok(arena.address_of(index))
    }

    /// Address-level wrapper around [`insert`](Self::insert).
    pub fn insert_address<A: Arena + ?Sized>(&mut self, arena: &mut A, address: u64, order: usize) -> u64 {
        let index = arena.index_of(address);
        let merged = self.insert(arena, index, order);
        arena.address_of(merged)
    }

    /// Every index on the list of `order`, head first.
    pub fn iter<'a, A: Arena + ?Sized>(&self, arena: &'a A, order: usize) -> impl Iterator<Item = usize> + 'a {
        let mut next = self.lists[order].head;
        core::iter::from_fn(move || {
            let current = next?;
            next = arena.block(current).and_then(|m| m.next);
            Some(current)
        })
    }

    fn push<A: Arena + ?Sized>(&mut self, arena: &mut A, index: usize, order: usize) {
        let list = &mut self.lists[order];
        let old = list.head;
        if let Some(old) = old
            && let Some(mut meta) = arena.block(old)
        {
            meta.prev = Some(index);
            arena.set_block(old, meta);
        }
        arena.set_block(
            index,
            BlockMeta {
                order: order_byte(order),
                linked: true,
                prev: None,
                next: old,
            },
        );
        list.head = Some(index);
        list.count += 1;
    }

    fn unlink<A: Arena + ?Sized>(&mut self, arena: &mut A, index: usize, order: usize) {
        let Some(meta) = arena.block(index) else {
            return;
        };
        if let Some(prev) = meta.prev
            && let Some(mut p) = arena.block(prev)
        {
            p.next = meta.next;
            arena.set_block(prev, p);
        } else {
            self.lists[order].head = meta.next;
        }
        if let Some(next) = meta.next
            && let Some(mut n) = arena.block(next)
        {
            n.prev = meta.prev;
            arena.set_block(next, n);
        }
        arena.set_block(
            index,
            BlockMeta {
                order: order_byte(order),
                ..BlockMeta::default()
            },
        );
        self.lists[order].count -= 1;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_util::xorshift;

    /// Plain vector arena; every index is a block slot.
    pub(crate) struct VecArena {
        pub(crate) meta: Vec<BlockMeta>,
        pub(crate) orders: usize,
        /// Indices at or above this belong to a second group.
        pub(crate) split_at: usize,
    }

    impl VecArena {
        pub(crate) fn new(units: usize, orders: usize) -> Self {
            Self {
                meta: vec![BlockMeta::default(); units],
                orders,
                split_at: usize::MAX,
            }
        }
    }

    impl Arena for VecArena {
        fn order_count(&self) -> usize {
            self.orders
        }

        fn address_of(&self, index: usize) -> u64 {
            index as u64 * 4096
        }

        fn index_of(&self, address: u64) -> usize {
            (address / 4096) as usize
        }

        fn block(&self, index: usize) -> Option<BlockMeta> {
            self.meta.get(index).copied()
        }

        fn set_block(&mut self, index: usize, meta: BlockMeta) {
            self.meta[index] = meta;
        }

        fn same_group(&self, a: usize, b: usize) -> bool {
            (a < self.split_at) == (b < self.split_at)
        }
    }

    #[test]
    fn buddy_law_is_self_inverse() {
        let mut next = xorshift(0xDEAD_BEEF);
        for _ in 0..1000 {
            let order = (next() % 20) as usize;
            let index = ((next() as usize) >> 8) & !((1 << order) - 1);
            let b = buddy_of(index, order);
            assert_eq!(b, index ^ (1 << order));
            assert_eq!(buddy_of(b, order), index);
            assert_eq!(primary_of(index, order), primary_of(b, order));
            assert_eq!(primary_of(index, order), index.min(b));
        }
    }

    #[test]
    fn order_is_monotonic_and_steps_at_powers_of_two() {
        let header = 16;
        let mut last = 0;
        for size in 1..70_000usize {
            let order = order_for(size, header, 5).unwrap();
            assert!(order >= last);
            if order_for(size + 1, header, 5) != Some(order) {
                assert!((size + header).is_power_of_two(), "step after {size}");
            }
            assert!(1 << order >= size + header);
            last = order;
        }
    }

    #[test]
    fn order_of_a_wrapping_size_is_none() {
        assert_eq!(order_for(usize::MAX, 16, 5), None);
        assert_eq!(order_for(usize::MAX - 15, 16, 5), Some(64));
        assert_eq!(order_for(usize::MAX - 8, 16, 5), None);
    }

    #[test]
    fn single_order_five_block_splits_into_one_of_each() {
        let mut arena = VecArena::new(32, 11);
        let mut areas = FreeAreas::new(11);
        areas.insert(&mut arena, 0, 5);
        assert_eq!(areas.free_units(), 32);

        let got = areas.find(&mut arena, 0).expect("block");
        assert_eq!(got, 0);
        assert_eq!(areas.free_units(), 31);
        for order in 0..5 {
            assert_eq!(areas.count(order), 1, "order {order}");
            let head = areas.iter(&arena, order).next().expect("head");
            assert_eq!(head, 1 << order);
        }
        assert_eq!(areas.count(5), 0);
    }

    #[test]
    fn buddies_merge_in_either_free_order() {
        for (first, second) in [(0usize, 1usize), (1, 0)] {
            let mut arena = VecArena::new(2, 11);
            let mut areas = FreeAreas::new(11);
            areas.insert(&mut arena, first, 0);
            assert_eq!(areas.insert(&mut arena, second, 0), 0);
            assert_eq!(areas.count(0), 0);
            assert_eq!(areas.count(1), 1);
        }
    }

    #[test]
    fn split_then_merge_restores_the_block() {
        let mut arena = VecArena::new(64, 11);
        let mut areas = FreeAreas::new(11);
        areas.insert(&mut arena, 0, 6);
        let before = arena.meta[0];

        let low = areas.find(&mut arena, 5).expect("low half");
        assert_eq!((low, areas.count(5)), (0, 1));
        areas.insert(&mut arena, low, 5);

        assert_eq!(areas.count(5), 0);
        assert_eq!(areas.count(6), 1);
        assert_eq!(arena.meta[0], before);
    }

    #[test]
    fn oversized_order_is_rejected_before_scanning() {
        let mut arena = VecArena::new(1, 11);
        let mut areas = FreeAreas::new(11);
        assert_eq!(
            areas.find(&mut arena, 11),
            Err(BuddyError::OrderTooLarge { order: 11, max: 10 })
        );
        assert_eq!(areas.find(&mut arena, 0), Err(BuddyError::OutOfMemory { order: 0 }));
    }

    #[test]
    fn groups_never_merge() {
        let mut arena = VecArena::new(4, 11);
        arena.split_at = 2;
        let mut areas = FreeAreas::new(11);
        areas.insert(&mut arena, 0, 1);
        areas.insert(&mut arena, 2, 1);
        assert_eq!(areas.count(1), 2);
        assert_eq!(areas.count(2), 0);
    }

    #[test]
    fn merging_stops_at_the_largest_order() {
        let mut arena = VecArena::new(8, 3);
        let mut areas = FreeAreas::new(3);
        for i in 0..8 {
            areas.insert(&mut arena, i, 0);
        }
        assert_eq!(areas.count(2), 2);
        assert_eq!(areas.free_units(), 8);
    }

    #[test]
    fn remove_takes_a_block_from_the_middle_of_a_list() {
        let mut arena = VecArena::new(16, 2);
        let mut areas = FreeAreas::new(2);
        for i in [0, 4, 8, 12] {
            areas.insert(&mut arena, i, 1);
        }
        assert_eq!(areas.remove(&mut arena, 4), 1);
        let left: Vec<_> = areas.iter(&arena, 1).collect();
        assert_eq!(left, vec![12, 8, 0]);
        assert!(!arena.meta[4].linked);
    }

    #[test]
    fn address_wrappers_use_the_arena_units() {
        let mut arena = VecArena::new(4, 3);
        let mut areas = FreeAreas::new(3);
        assert_eq!(areas.insert_address(&mut arena, 0x2000, 1), 0x2000);
        assert_eq!(areas.find_address(&mut arena, 0), Ok(0x2000));
    }

    #[test]
    fn random_traffic_conserves_units_and_never_overlaps() {
        let units = 1 << 10;
        let mut arena = VecArena::new(units, 11);
        let mut areas = FreeAreas::new(11);
        areas.insert(&mut arena, 0, 10);
        let mut next = xorshift(42);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for _ in 0..5000 {
            if live.is_empty() || next() % 3 != 0 {
                let order = (next() % 5) as usize;
                if let Ok(i) = areas.find(&mut arena, order) {
                    for &(j, o) in &live {
                        assert!(i + (1 << order) <= j || j + (1 << o) <= i, "overlap");
                    }
                    live.push((i, order));
                }
            } else {
                let k = (next() as usize) % live.len();
                let (i, o) = live.swap_remove(k);
                areas.insert(&mut arena, i, o);
            }
            let used: u64 = live.iter().map(|&(_, o)| 1u64 << o).sum();
            assert_eq!(areas.free_units() + used, units as u64);
        }

        for (i, o) in live.drain(..) {
            areas.insert(&mut arena, i, o);
        }
        assert_eq!(areas.count(10), 1);
        assert_eq!(areas.free_units(), units as u64);
    }
}
