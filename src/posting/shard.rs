// # Posting Shard
//
// Sparse group-block table over one shard's hash window. The window is cut
// into groups of `group_size` hashes; an occupied group carries a presence
// bitmap and its slot lists packed in bitmap-set order. Empty groups are
// absent map entries. Slot lists stay sorted by (document, position) with no
// duplicates.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::document::DocumentId;
use crate::error::{MatchError, Result};
use crate::posting::Posting;

/// Default number of hashes per group.
pub const DEFAULT_GROUP_SIZE: u32 = 24;

pub struct PostingShard {
    offset: u64,
    // Inclusive upper bound of the owned window. The last shard of a topology
    // extends to 2^H - 1 to absorb the division remainder.
    end: u64,
    group_size: u32,
    groups: DashMap<u64, Group>,
    postings: AtomicU64,
}

#[derive(Default)]
pub(crate) struct Group {
    pub(crate) bitmap: u64,
    pub(crate) slots: Vec<Vec<Posting>>,
}

impl Group {
    #[inline]
    fn rank(&self, slot: u32) -> usize {
        (self.bitmap & ((1u64 << slot) - 1)).count_ones() as usize
    }

    fn insert(&mut self, slot: u32, posting: Posting) -> bool {
        let rank = self.rank(slot);
        if self.bitmap & (1u64 << slot) != 0 {
            let list = &mut self.slots[rank];
            match list.binary_search(&posting) {
                Ok(_) => false,
                Err(at) => {
                    list.insert(at, posting);
                    true
                }
            }
        } else {
            self.slots.insert(rank, vec![posting]);
            self.bitmap |= 1u64 << slot;
            true
        }
    }

    fn remove(&mut self, slot: u32, posting: Posting) -> bool {
        if self.bitmap & (1u64 << slot) == 0 {
            return false;
        }
        let rank = self.rank(slot);
        let list = &mut self.slots[rank];
        match list.binary_search(&posting) {
            Ok(at) => {
                list.remove(at);
                if list.is_empty() {
                    self.slots.remove(rank);
                    self.bitmap &= !(1u64 << slot);
                }
                true
            }
            Err(_) => false,
        }
    }

    fn remove_document(&mut self, doc: DocumentId) -> u64 {
        let mut removed = 0u64;
        let mut bitmap = 0u64;
        let mut slots = Vec::with_capacity(self.slots.len());
        let mut rank = 0usize;
        for slot in 0..64u32 {
            if self.bitmap & (1u64 << slot) == 0 {
                continue;
            }
            let mut list = std::mem::take(&mut self.slots[rank]);
            rank += 1;
            let before = list.len();
            list.retain(|p| p.doc != doc);
            removed += (before - list.len()) as u64;
            if !list.is_empty() {
                bitmap |= 1u64 << slot;
                slots.push(list);
            }
        }
        self.bitmap = bitmap;
        self.slots = slots;
        removed
    }

    fn is_empty(&self) -> bool {
        self.bitmap == 0
    }
}

impl PostingShard {
    /// Build an empty shard over `[offset, offset + size)`. A `size` of zero
    /// wraps and means the full u64 range (hash_width 64, one shard).
    pub fn new(offset: u64, size: u64, group_size: u32) -> Result<Self> {
        if group_size == 0 || group_size > 64 {
            return Err(MatchError::Configuration(format!(
                "group_size {} out of range [1, 64]",
                group_size
            )));
        }
        let end = offset.wrapping_add(size).wrapping_sub(1);
        if end < offset && !(offset == 0 && size == 0) {
            return Err(MatchError::Configuration(format!(
                "shard window [{}, {}] is inverted",
                offset, end
            )));
        }
        Ok(Self {
            offset,
            end,
            group_size,
            groups: DashMap::new(),
            postings: AtomicU64::new(0),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Inclusive upper bound of the owned hash window.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    /// Hashes in the owned window, as u128 to hold a full-range shard.
    pub fn span(&self) -> u128 {
        (self.end - self.offset) as u128 + 1
    }

    pub fn group_count(&self) -> u64 {
        ((self.span() + self.group_size as u128 - 1) / self.group_size as u128) as u64
    }

    /// Total postings currently stored.
    pub fn posting_count(&self) -> u64 {
        self.postings.load(Ordering::Relaxed)
    }

    /// Occupied (non-empty) groups.
    pub fn occupied_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[inline]
    fn locate(&self, hash: u64) -> Result<(u64, u32)> {
        if hash < self.offset || hash > self.end {
            return Err(MatchError::Invalid(format!(
                "hash {:#x} outside shard window [{:#x}, {:#x}]",
                hash, self.offset, self.end
            )));
        }
        let local = hash - self.offset;
        Ok((
            local / self.group_size as u64,
            (local % self.group_size as u64) as u32,
        ))
    }

    /// Insert a posting. Exact duplicates are rejected silently; returns
    /// whether the posting was new. The group entry lock makes the write
    /// exclusive for that group only.
    pub fn add(&self, hash: u64, doc: DocumentId, position: u32) -> Result<bool> {
        let (group, slot) = self.locate(hash)?;
        let inserted = self
            .groups
            .entry(group)
            .or_default()
            .insert(slot, Posting::new(doc, position));
        if inserted {
            self.postings.fetch_add(1, Ordering::Relaxed);
        }
        Ok(inserted)
    }

    /// Remove one posting. Returns false when it was not present. An emptied
    /// slot clears its bit; an emptied group releases its storage.
    pub fn remove(&self, hash: u64, doc: DocumentId, position: u32) -> Result<bool> {
        let (group, slot) = self.locate(hash)?;
        let removed = match self.groups.get_mut(&group) {
            Some(mut entry) => entry.remove(slot, Posting::new(doc, position)),
            None => false,
        };
        if removed {
            self.postings.fetch_sub(1, Ordering::Relaxed);
            self.groups.remove_if(&group, |_, g| g.is_empty());
        }
        Ok(removed)
    }

    /// Postings recorded for `hash`, in (document, position) order.
    pub fn lookup(&self, hash: u64) -> Result<Vec<Posting>> {
        let (group, slot) = self.locate(hash)?;
        Ok(match self.groups.get(&group) {
            Some(entry) => {
                if entry.bitmap & (1u64 << slot) == 0 {
                    Vec::new()
                } else {
                    entry.slots[entry.rank(slot)].clone()
                }
            }
            None => Vec::new(),
        })
    }

    /// Occupied group indices in ascending order. Snapshot of a moment; used
    /// to chunk long scans.
    pub fn group_keys(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.groups.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        keys
    }

    /// Remove every posting of `doc` within the given groups. Returns the
    /// number removed. Callers chunk `keys` to keep individual calls short.
    pub fn remove_document_in_groups(&self, keys: &[u64], doc: DocumentId) -> u64 {
        let mut removed = 0u64;
        for key in keys {
            if let Some(mut entry) = self.groups.get_mut(key) {
                removed += entry.remove_document(doc);
            }
            self.groups.remove_if(key, |_, g| g.is_empty());
        }
        if removed > 0 {
            self.postings.fetch_sub(removed, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every posting of `doc` across the whole shard.
    pub fn remove_document(&self, doc: DocumentId) -> u64 {
        self.remove_document_in_groups(&self.group_keys(), doc)
    }

    /// Every stored (hash, postings) pair in ascending hash order.
    pub fn dump(&self) -> Vec<(u64, Vec<Posting>)> {
        let mut out = Vec::new();
        for key in self.group_keys() {
            if let Some(entry) = self.groups.get(&key) {
                for slot in 0..self.group_size {
                    if entry.bitmap & (1u64 << slot) == 0 {
                        continue;
                    }
                    let hash = self.offset + key * self.group_size as u64 + slot as u64;
                    out.push((hash, entry.slots[entry.rank(slot)].clone()));
                }
            }
        }
        out
    }

    /// Replace this shard's contents with `other`'s. Windows must agree.
    pub fn install(&self, other: PostingShard) -> Result<()> {
        if other.offset != self.offset
            || other.end != self.end
            || other.group_size != self.group_size
        {
            return Err(MatchError::Invalid(format!(
                "shard window mismatch: [{:#x}, {:#x}] vs [{:#x}, {:#x}]",
                other.offset, other.end, self.offset, self.end
            )));
        }
        self.groups.clear();
        let count = other.postings.load(Ordering::Relaxed);
        for (key, group) in other.groups {
            self.groups.insert(key, group);
        }
        self.postings.store(count, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn group(&self, key: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, Group>> {
        self.groups.get(&key)
    }

    pub(crate) fn insert_group(&self, key: u64, group: Group) {
        let added: u64 = group.slots.iter().map(|s| s.len() as u64).sum();
        self.groups.insert(key, group);
        self.postings.fetch_add(added, Ordering::Relaxed);
    }
}
