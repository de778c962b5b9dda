//! A single open-addressing Swiss table: parallel control-byte and
//! slot arrays, group-wise SWAR probing, tombstone-aware deletion and
//! allocation-free rehashing.
//!
//! The directory in `crate::map` composes one or more of these buckets
//! into the public map.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::alloc::BucketAlloc;
use crate::error::{Result, SplitMapError};
use crate::hint::likely;

pub(crate) mod bitmask;
pub(crate) mod group;

use self::bitmask::BitMask;
use self::group::Group;

/// Control byte value for an empty lane.
pub(crate) const EMPTY: u8 = 0b1111_1111;
/// Control byte value for a deleted lane (tombstone).
pub(crate) const DELETED: u8 = 0b1000_0000;
/// Control byte value terminating the logical lanes of a bucket.
///
/// The high bit keeps it out of the full range; bit 6 stays clear so
/// `match_empty` never sees it, and it is neither `EMPTY` nor
/// `DELETED`, so no match ever selects the reserved trailing slot.
pub(crate) const SENTINEL: u8 = 0b1011_1111;

/// Smallest capacity an allocated bucket can have: one full group of
/// lanes plus the sentinel.
pub(crate) const MIN_BUCKET_CAPACITY: usize = Group::WIDTH - 1;

/// Checks whether a control byte represents a full lane (top bit is clear).
#[inline]
pub(crate) fn is_full(ctrl: u8) -> bool {
    ctrl & 0x80 == 0
}

/// Checks whether a special control byte is EMPTY (just check 1 bit).
///
/// `EMPTY` is the only special with bit 0 set, which is what makes the
/// "does this insert consume growth budget" test a single AND.
#[inline]
pub(crate) fn special_is_empty(ctrl: u8) -> bool {
    debug_assert!(ctrl & 0x80 != 0);
    ctrl & 0x01 != 0
}

/// Primary hash, drives the probe sequence and (from its top bits)
/// directory routing.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn h1(hash: u64) -> usize {
    (hash >> 7) as usize
}

/// Secondary hash, the low 7 bits, stored in the control byte of a
/// full lane.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn h2(hash: u64) -> u8 {
    (hash & 0x7f) as u8
}

/// Probe sequence based on triangular numbers, which is guaranteed
/// (since the lane count `capacity + 1` is a power of two) to visit
/// every group exactly once.
///
/// The start position is the h1 bits masked into the table and aligned
/// down to a group boundary, so every visited offset is an aligned
/// group and loads never need the mirrored tail.
///
/// Proof that the probe will visit every group in the table:
/// <https://fgiesen.wordpress.com/2015/02/22/triangular-numbers-mod-2n/>
pub(crate) struct ProbeSeq {
    mask: usize,
    pos: usize,
    stride: usize,
}

impl ProbeSeq {
    #[inline]
    pub(crate) fn new(hash: u64, mask: usize) -> Self {
        ProbeSeq {
            mask,
            pos: (h1(hash) & mask) & !(Group::WIDTH - 1),
            stride: 0,
        }
    }
}

impl Iterator for ProbeSeq {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.stride >= self.mask {
            return None;
        }

        let result = self.pos;
        self.stride += Group::WIDTH;
        self.pos += self.stride;
        self.pos &= self.mask;
        Some(result)
    }
}

/// Returns the number of entries a bucket of the given capacity can
/// hold before it must grow or rehash (87.5% max load).
#[inline]
pub(crate) fn bucket_capacity_to_growth(capacity: usize) -> usize {
    debug_assert!(capacity == 0 || (capacity + 1).is_power_of_two());
    if capacity == 0 {
        0
    } else {
        capacity - (capacity + 1) / 8
    }
}

/// Returns the smallest power-of-two-minus-one capacity whose growth
/// budget covers `cap` entries, or an overflow error.
pub(crate) fn capacity_for(cap: usize) -> Result<usize> {
    let overflow = || SplitMapError::CapacityOverflow;
    let adjusted = cap.checked_mul(8).ok_or_else(overflow)? / 7;
    let lanes = adjusted
        .checked_add(1)
        .and_then(usize::checked_next_power_of_two)
        .ok_or_else(overflow)?;
    let mut capacity = usize::max(lanes - 1, MIN_BUCKET_CAPACITY);
    // The 8/7 estimate rounds down; step up when it undershoots.
    while bucket_capacity_to_growth(capacity) < cap {
        capacity = capacity
            .checked_mul(2)
            .and_then(|c| c.checked_add(1))
            .ok_or_else(overflow)?;
    }
    Ok(capacity)
}

/// One Swiss table.
///
/// `capacity` is a power of two minus one; lane `capacity` of the
/// control array permanently holds [`SENTINEL`] and the matching slot
/// cell is reserved. The control array carries `Group::WIDTH` extra
/// trailing bytes mirroring the logical prefix so unaligned wrap-around
/// group loads need no bounds checks. A zero-capacity bucket owns no
/// storage and aims its control pointer at a static all-EMPTY group.
pub(crate) struct RawBucket<K, V> {
    ctrl: NonNull<u8>,
    slots: NonNull<(K, V)>,
    capacity: usize,
    used: usize,
    growth_left: usize,
    local_depth: u8,
    marker: PhantomData<(K, V)>,
}

impl<K, V> RawBucket<K, V> {
    /// Creates a bucket without allocating any storage.
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            ctrl: unsafe { NonNull::new_unchecked(Group::static_empty().as_ptr() as *mut u8) },
            slots: NonNull::dangling(),
            capacity: 0,
            used: 0,
            growth_left: 0,
            local_depth: 0,
            marker: PhantomData,
        }
    }

    /// Allocates a bucket with the given capacity, which must be a
    /// power of two minus one no smaller than [`MIN_BUCKET_CAPACITY`].
    pub(crate) fn with_capacity_in<A: BucketAlloc>(alloc: &A, capacity: usize) -> Result<Self> {
        debug_assert!((capacity + 1).is_power_of_two());
        debug_assert!(capacity >= MIN_BUCKET_CAPACITY);
        let (ctrl_layout, slots_layout) = Self::layouts(capacity)?;
        let (ctrl, slots) = unsafe { alloc.alloc(ctrl_layout, slots_layout)? };
        let bucket = Self {
            ctrl,
            slots: slots.cast(),
            capacity,
            used: 0,
            growth_left: bucket_capacity_to_growth(capacity),
            local_depth: 0,
            marker: PhantomData,
        };
        unsafe {
            bucket
                .ctrl
                .as_ptr()
                .write_bytes(EMPTY, bucket.num_ctrl_bytes());
            bucket.set_ctrl(capacity, SENTINEL);
        }
        Ok(bucket)
    }

    fn layouts(capacity: usize) -> Result<(Layout, Layout)> {
        let ctrl = Layout::from_size_align(capacity + 1 + Group::WIDTH, Group::WIDTH)
            .map_err(|_| SplitMapError::CapacityOverflow)?;
        let slots = Layout::array::<(K, V)>(capacity + 1)
            .map_err(|_| SplitMapError::CapacityOverflow)?;
        // Zero-sized entries still need a well-formed allocation request.
        let slots = if slots.size() == 0 {
            Layout::new::<u8>()
        } else {
            slots
        };
        Ok((ctrl, slots))
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub(crate) fn growth_left(&self) -> usize {
        self.growth_left
    }

    /// Entries this bucket can hold at its max load factor.
    #[inline]
    pub(crate) fn budget(&self) -> usize {
        bucket_capacity_to_growth(self.capacity)
    }

    /// Number of tombstoned lanes, derived from the growth accounting:
    /// every lane that left the budget without being full is a
    /// tombstone.
    #[inline]
    pub(crate) fn tombstones(&self) -> usize {
        self.budget() - self.used - self.growth_left
    }

    #[inline]
    pub(crate) fn local_depth(&self) -> u8 {
        self.local_depth
    }

    #[inline]
    pub(crate) fn set_local_depth(&mut self, depth: u8) {
        self.local_depth = depth;
    }

    /// Number of aligned groups covering the logical lanes.
    #[inline]
    pub(crate) fn num_groups(&self) -> usize {
        (self.capacity + 1) / Group::WIDTH
    }

    #[inline]
    fn num_ctrl_bytes(&self) -> usize {
        self.capacity + 1 + Group::WIDTH
    }

    /// Returns a pointer to a control byte.
    #[inline]
    unsafe fn ctrl(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.num_ctrl_bytes());
        self.ctrl.as_ptr().add(index)
    }

    /// Returns a pointer to a slot cell.
    #[inline]
    pub(crate) unsafe fn slot(&self, index: usize) -> *mut (K, V) {
        debug_assert!(index < self.capacity);
        self.slots.as_ptr().add(index)
    }

    /// Sets a control byte, and possibly also the mirrored copy at the
    /// end of the array.
    ///
    /// Branch-free: for `index >= Group::WIDTH` the second write lands
    /// on the same byte, otherwise on the tail mirror of the logical
    /// prefix.
    #[inline]
    unsafe fn set_ctrl(&self, index: usize, ctrl: u8) {
        debug_assert_ne!(self.capacity, 0);
        let index2 = ((index.wrapping_sub(Group::WIDTH)) & self.capacity) + Group::WIDTH;
        *self.ctrl(index) = ctrl;
        *self.ctrl(index2) = ctrl;
    }

    #[inline]
    fn probe_seq(&self, hash: u64) -> ProbeSeq {
        ProbeSeq::new(hash, self.capacity)
    }

    /// Whether claiming `slot` for an insertion consumes growth budget
    /// (the lane is EMPTY rather than a reusable tombstone).
    #[inline]
    pub(crate) fn claims_budget(&self, slot: usize) -> bool {
        special_is_empty(unsafe { *self.ctrl(slot) })
    }

    /// Searches for an entry, returning its lane index.
    ///
    /// The walk stops at the first group containing an EMPTY lane: an
    /// EMPTY lane has never been full, so no insertion can have probed
    /// past it.
    #[inline]
    pub(crate) fn find(&self, hash: u64, mut eq: impl FnMut(&(K, V)) -> bool) -> Option<usize> {
        unsafe {
            for pos in self.probe_seq(hash) {
                let group = Group::load_aligned(self.ctrl(pos));
                for bit in group.match_byte(h2(hash)) {
                    let index = pos + bit;
                    if likely(eq(&*self.slot(index))) {
                        return Some(index);
                    }
                }
                if group.match_empty().any_bit_set() {
                    return None;
                }
            }
        }
        None
    }

    /// Searches for an entry or, failing that, for the lane an
    /// insertion of it must claim: the first EMPTY or DELETED lane
    /// along the probe sequence.
    ///
    /// Requires an allocated bucket with at least one non-full lane.
    #[inline]
    pub(crate) fn find_or_find_insert_slot(
        &self,
        hash: u64,
        mut eq: impl FnMut(&(K, V)) -> bool,
    ) -> std::result::Result<usize, usize> {
        debug_assert_ne!(self.capacity, 0);
        unsafe {
            let mut insert_slot = None;
            for pos in self.probe_seq(hash) {
                let group = Group::load_aligned(self.ctrl(pos));
                for bit in group.match_byte(h2(hash)) {
                    let index = pos + bit;
                    if likely(eq(&*self.slot(index))) {
                        return Ok(index);
                    }
                }
                if insert_slot.is_none() {
                    if let Some(bit) = group.match_empty_or_deleted().lowest_set_bit() {
                        insert_slot = Some(pos + bit);
                    }
                }
                if group.match_empty().any_bit_set() {
                    return Err(insert_slot.unwrap());
                }
            }
        }
        // The growth budget keeps at least one EMPTY lane in any
        // allocated bucket, so some group terminates the walk.
        unreachable!();
    }

    /// Searches for the first EMPTY or DELETED lane for `hash`.
    #[inline]
    fn find_insert_slot(&self, hash: u64) -> usize {
        unsafe {
            for pos in self.probe_seq(hash) {
                let group = Group::load_aligned(self.ctrl(pos));
                if let Some(bit) = group.match_empty_or_deleted().lowest_set_bit() {
                    return pos + bit;
                }
            }
        }
        unreachable!();
    }

    /// Writes an entry into a lane previously obtained from
    /// [`find_or_find_insert_slot`].
    ///
    /// The growth budget is only charged when the lane was EMPTY;
    /// reclaiming a tombstone is free.
    #[inline]
    pub(crate) unsafe fn insert_at(&mut self, index: usize, hash: u64, entry: (K, V)) {
        let old_ctrl = *self.ctrl(index);
        debug_assert!(!is_full(old_ctrl));
        debug_assert!(self.growth_left > 0 || !special_is_empty(old_ctrl));
        self.growth_left -= special_is_empty(old_ctrl) as usize;
        self.used += 1;
        self.set_ctrl(index, h2(hash));
        self.slot(index).write(entry);
    }

    /// Moves an entry into a bucket known to contain no tombstone and
    /// enough budget, as during resize and split redistribution.
    pub(crate) unsafe fn append(&mut self, hash: u64, entry: (K, V)) {
        let index = self.find_insert_slot(hash);
        debug_assert!(special_is_empty(*self.ctrl(index)));
        debug_assert!(self.growth_left > 0);
        self.growth_left -= 1;
        self.used += 1;
        self.set_ctrl(index, h2(hash));
        self.slot(index).write(entry);
    }

    /// Whether erasing `index` may write EMPTY instead of a tombstone.
    ///
    /// If the lane sits inside a run of `Group::WIDTH` or more
    /// consecutive full-or-deleted lanes, some probe window may have
    /// seen an all-non-empty group here and continued; the lane must
    /// then keep a tombstone so later lookups keep searching too. The
    /// two unaligned loads wrap through the mirrored tail.
    #[inline]
    unsafe fn erase_keeps_tombstone(&self, index: usize) -> bool {
        let index_before = index.wrapping_sub(Group::WIDTH) & self.capacity;
        let empty_before = Group::load(self.ctrl(index_before)).match_empty();
        let empty_after = Group::load(self.ctrl(index)).match_empty();

        // Note that in this context `leading_zeros` refers to the lanes
        // at the end of a group, while `trailing_zeros` refers to the
        // lanes at the beginning of a group.
        empty_before.leading_zeros() + empty_after.trailing_zeros() >= Group::WIDTH
    }

    /// Removes the entry at `index` and returns it.
    pub(crate) unsafe fn erase(&mut self, index: usize) -> (K, V) {
        debug_assert!(is_full(*self.ctrl(index)));
        let entry = ptr::read(self.slot(index));
        let ctrl = if self.erase_keeps_tombstone(index) {
            DELETED
        } else {
            self.growth_left += 1;
            EMPTY
        };
        self.set_ctrl(index, ctrl);
        self.used -= 1;
        entry
    }

    /// Rehashes every entry into freshly allocated arrays of
    /// `new_capacity` lanes and releases the old arrays.
    pub(crate) fn resize<A: BucketAlloc>(
        &mut self,
        alloc: &A,
        new_capacity: usize,
        hasher: impl Fn(&(K, V)) -> u64,
    ) -> Result<()> {
        debug_assert!(bucket_capacity_to_growth(new_capacity) >= self.used);
        let mut new_bucket = Self::with_capacity_in(alloc, new_capacity)?;
        new_bucket.local_depth = self.local_depth;
        unsafe {
            for index in self.full_lanes() {
                let entry = ptr::read(self.slot(index));
                let hash = hasher(&entry);
                new_bucket.append(hash, entry);
            }
            // Entries have been moved out; release storage only.
            if self.capacity != 0 {
                self.free_arrays(alloc);
            }
        }
        *self = new_bucket;
        Ok(())
    }

    /// Rehashes the bucket in place, reclaiming every tombstone
    /// without allocating.
    ///
    /// First pass flips specials to EMPTY and full lanes to DELETED
    /// ("not yet placed"), then restores the sentinel and the mirrored
    /// tail. Second pass re-places each marked entry: a lane already in
    /// its first probe group is fixed up without moving; otherwise the
    /// entry moves to an EMPTY lane or swaps with another displaced
    /// entry, which is then re-placed in turn.
    pub(crate) fn rehash_in_place(&mut self, hasher: impl Fn(&(K, V)) -> u64) {
        debug_assert_ne!(self.capacity, 0);
        unsafe {
            for g in 0..self.num_groups() {
                let p = self.ctrl(g * Group::WIDTH);
                Group::load_aligned(p)
                    .convert_special_to_empty_and_full_to_deleted()
                    .store_aligned(p);
            }
            *self.ctrl(self.capacity) = SENTINEL;
            ptr::copy_nonoverlapping(
                self.ctrl(0),
                self.ctrl(self.capacity + 1),
                Group::WIDTH,
            );

            'outer: for i in 0..self.capacity {
                if *self.ctrl(i) != DELETED {
                    continue;
                }

                loop {
                    let hash = hasher(&*self.slot(i));
                    let new_i = self.find_insert_slot(hash);

                    // Moving within the starting probe group changes
                    // nothing for lookups: fix the control byte up in
                    // place.
                    let probe_pos = ProbeSeq::new(hash, self.capacity).pos;
                    let probe_index =
                        |pos: usize| (pos.wrapping_sub(probe_pos) & self.capacity) / Group::WIDTH;
                    if likely(probe_index(i) == probe_index(new_i)) {
                        self.set_ctrl(i, h2(hash));
                        continue 'outer;
                    }

                    let prev_ctrl = *self.ctrl(new_i);
                    self.set_ctrl(new_i, h2(hash));
                    if prev_ctrl == EMPTY {
                        self.set_ctrl(i, EMPTY);
                        ptr::copy_nonoverlapping(self.slot(i), self.slot(new_i), 1);
                        continue 'outer;
                    }

                    // The destination still holds a displaced entry;
                    // swap and place that one next.
                    debug_assert_eq!(prev_ctrl, DELETED);
                    ptr::swap(self.slot(i), self.slot(new_i));
                }
            }

            self.growth_left = self.budget() - self.used;
        }
    }

    /// Destroys every entry and resets the lanes, keeping capacity.
    pub(crate) fn clear(&mut self) {
        if self.capacity == 0 {
            return;
        }
        unsafe {
            if mem::needs_drop::<(K, V)>() && self.used != 0 {
                for index in self.full_lanes() {
                    ptr::drop_in_place(self.slot(index));
                }
            }
            self.ctrl
                .as_ptr()
                .write_bytes(EMPTY, self.num_ctrl_bytes());
            self.set_ctrl(self.capacity, SENTINEL);
        }
        self.used = 0;
        self.growth_left = self.budget();
    }

    /// Destroys every entry and returns the storage to the allocator,
    /// leaving an unallocated bucket behind.
    pub(crate) fn free<A: BucketAlloc>(&mut self, alloc: &A) {
        if self.capacity == 0 {
            return;
        }
        unsafe {
            if mem::needs_drop::<(K, V)>() && self.used != 0 {
                for index in self.full_lanes() {
                    ptr::drop_in_place(self.slot(index));
                }
            }
            self.free_arrays(alloc);
        }
        let depth = self.local_depth;
        *self = Self::new();
        self.local_depth = depth;
    }

    /// Releases the arrays without touching entries. Leaves the
    /// pointers dangling; the caller overwrites `self` or resets it.
    pub(crate) unsafe fn free_arrays<A: BucketAlloc>(&mut self, alloc: &A) {
        debug_assert_ne!(self.capacity, 0);
        let (ctrl_layout, slots_layout) =
            Self::layouts(self.capacity).unwrap_or_else(|_| unreachable!());
        alloc.free((self.ctrl, ctrl_layout), (self.slots.cast(), slots_layout));
    }

    /// Iterator over the indices of all full lanes.
    ///
    /// The caller must not grow, shrink or free the bucket while the
    /// iterator is alive; erasing already-yielded lanes is fine.
    pub(crate) unsafe fn full_lanes(&self) -> FullLanes {
        FullLanes::new(self.ctrl.as_ptr(), self.num_groups())
    }

    /// The full-lane mask of one aligned group, for seeded traversals.
    pub(crate) unsafe fn full_mask_at(&self, group: usize) -> BitMask {
        debug_assert!(group < self.num_groups());
        Group::load_aligned(self.ctrl(group * Group::WIDTH)).match_full()
    }
}

unsafe impl<K, V> Send for RawBucket<K, V>
where
    K: Send,
    V: Send,
{
}
unsafe impl<K, V> Sync for RawBucket<K, V>
where
    K: Sync,
    V: Sync,
{
}

/// Iterator over the full lanes of a bucket, group by group.
pub(crate) struct FullLanes {
    ctrl: *const u8,
    group: usize,
    num_groups: usize,
    base: usize,
    current: BitMask,
}

impl FullLanes {
    unsafe fn new(ctrl: *const u8, num_groups: usize) -> Self {
        let current = if num_groups == 0 {
            BitMask(0)
        } else {
            Group::load_aligned(ctrl).match_full()
        };
        Self {
            ctrl,
            group: 0,
            num_groups,
            base: 0,
            current,
        }
    }
}

impl Iterator for FullLanes {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        loop {
            if let Some(bit) = self.current.lowest_set_bit() {
                self.current = self.current.remove_lowest_bit();
                return Some(self.base + bit);
            }
            self.group += 1;
            if self.group >= self.num_groups {
                return None;
            }
            self.base = self.group * Group::WIDTH;
            self.current =
                unsafe { Group::load_aligned(self.ctrl.add(self.base)).match_full() };
        }
    }
}
