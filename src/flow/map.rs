//! Flow map: a fixed-bucket-count hash table keyed by [`FlowDescriptor`],
//! supporting flows addressable under a primary descriptor and, optionally,
//! a second one for dual-sided NAT.
//!
//! Grounded on `IpFlowMap.hpp`: `bit_size` (8-30) sizes the bucket array,
//! `index_for` uses the same XOR-fold (`(hash >> bit_size) ^ hash) &
//! bit_mask`) as `IpFlowMap::getIndex`, and [`ExpiryMode`] mirrors
//! `DontExpireFlows`/`ExpireFlows`. The original represents a dual-key flow
//! as one `IpFlow` object threaded onto two intrusive `_next` chains at
//! once; here a logical flow's value is stored exactly once (in `entries`)
//! and up to two small chain nodes (in `nodes`) point at it, so a dual-key
//! lookup under either descriptor reaches the same value without cloning
//! it. Both slabs are `Vec<Slot<_>>` with `Option<usize>` free lists, the
//! same technique `flow/desc.rs`'s single-key predecessor used, keeping the
//! whole map within `#![forbid(unsafe_code)]`. The "a flow may delete
//! itself inside its own removal callback" hazard (`IpFlow.hpp`'s
//! `flowRemoved`) is sidestepped by [`Eviction`]: callbacks return an
//! intent the map acts on after the callback returns, instead of the
//! callback mutating the map directly.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, TermError};
use crate::flow::desc::FlowDescriptor;

/// Controls whether expired entries are cleaned up opportunistically while
/// walking a bucket during a lookup, matching `IpFlowMap::ExpiryMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryMode {
    DontExpireFlows,
    ExpireFlows,
}

/// What a [`FlowMap::sweep`] decision closure wants done with the entry it
/// was just shown. Lets a full-table sweep (e.g. a periodic idle pass driven
/// by the owner loop, independent of any particular lookup) signal eviction
/// without being handed `&mut FlowMap` itself mid-iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    Retain,
    EvictNow,
}

/// One bucket-chain link for one descriptor. A dual-key entry has two of
/// these, in (possibly different) buckets, both pointing at the same
/// `entry` slot.
struct BucketNode {
    desc: FlowDescriptor,
    entry: usize,
    next: Option<usize>,
}

enum NodeSlot {
    Occupied(BucketNode),
    Free(Option<usize>),
}

/// The value storage for one logical flow, held once regardless of whether
/// it is reachable under one or two descriptors.
struct EntryRec<T> {
    primary: FlowDescriptor,
    secondary: Option<FlowDescriptor>,
    value: T,
}

enum EntrySlot<T> {
    Occupied(EntryRec<T>),
    Free(Option<usize>),
}

/// A bucketed map from [`FlowDescriptor`] to a caller-supplied flow value
/// `T` (a TCP or UDP terminator).
pub struct FlowMap<T> {
    bit_size: u8,
    bit_mask: u32,
    buckets: Vec<Option<usize>>,
    nodes: Vec<NodeSlot>,
    node_free_head: Option<usize>,
    entries: Vec<EntrySlot<T>>,
    entry_free_head: Option<usize>,
    used_buckets: u32,
    len: usize,
}

impl<T> FlowMap<T> {
    /// `bit_size` is the map size in bits (10 => 1024 buckets), matching
    /// `IpFlowMap`'s constructor contract. Allowed range: 8-30.
    pub fn new(bit_size: u8) -> Result<Self> {
        if !(8..=30).contains(&bit_size) {
            return Err(TermError::InvalidParameter(format!(
                "flow map bit_size must be 8..=30, got {bit_size}"
            )));
        }
        let map_size = 1usize << bit_size;
        Ok(Self {
            bit_size,
            bit_mask: (map_size - 1) as u32,
            buckets: vec![None; map_size],
            nodes: Vec::new(),
            node_free_head: None,
            entries: Vec::new(),
            entry_free_head: None,
            used_buckets: 0,
            len: 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.used_buckets < 1
    }

    /// Number of logical flows (a dual-key flow counts once).
    pub fn len(&self) -> usize {
        self.len
    }

    fn index_for(&self, desc: &FlowDescriptor) -> usize {
        let hash = desc.hash();
        (((hash >> self.bit_size) ^ hash) & self.bit_mask) as usize
    }

    fn alloc_node(&mut self, node: BucketNode) -> usize {
        if let Some(idx) = self.node_free_head.take() {
            if let NodeSlot::Free(next) = &self.nodes[idx] {
                self.node_free_head = *next;
            }
            self.nodes[idx] = NodeSlot::Occupied(node);
            idx
        } else {
            self.nodes.push(NodeSlot::Occupied(node));
            self.nodes.len() - 1
        }
    }

    fn free_node(&mut self, idx: usize) {
        self.nodes[idx] = NodeSlot::Free(self.node_free_head);
        self.node_free_head = Some(idx);
    }

    fn alloc_entry(&mut self, rec: EntryRec<T>) -> usize {
        if let Some(idx) = self.entry_free_head.take() {
            if let EntrySlot::Free(next) = &self.entries[idx] {
                self.entry_free_head = *next;
            }
            self.entries[idx] = EntrySlot::Occupied(rec);
            idx
        } else {
            self.entries.push(EntrySlot::Occupied(rec));
            self.entries.len() - 1
        }
    }

    fn take_entry(&mut self, idx: usize) -> EntryRec<T> {
        let old = std::mem::replace(&mut self.entries[idx], EntrySlot::Free(self.entry_free_head));
        self.entry_free_head = Some(idx);
        match old {
            EntrySlot::Occupied(rec) => rec,
            EntrySlot::Free(_) => unreachable!("freeing an already-free entry"),
        }
    }

    fn link_node(&mut self, desc: FlowDescriptor, entry: usize) {
        let bucket = self.index_for(&desc);
        let head = self.buckets[bucket];
        if head.is_none() {
            self.used_buckets += 1;
        }
        let idx = self.alloc_node(BucketNode { desc, entry, next: head });
        self.buckets[bucket] = Some(idx);
    }

    /// Unlinks the node for `(desc, entry)` from its bucket. A no-op if no
    /// such node exists (e.g. it was already detached by a bucket cleanup
    /// pass that happened to cover both of a dual-key entry's nodes).
    fn unlink_node(&mut self, desc: &FlowDescriptor, entry: usize) {
        let bucket = self.index_for(desc);
        let mut cursor = self.buckets[bucket];
        let mut prev: Option<usize> = None;
        while let Some(idx) = cursor {
            let (matches, next) = match &self.nodes[idx] {
                NodeSlot::Occupied(n) => (n.desc == *desc && n.entry == entry, n.next),
                NodeSlot::Free(_) => unreachable!(),
            };
            if matches {
                match prev {
                    Some(p) => {
                        if let NodeSlot::Occupied(n) = &mut self.nodes[p] {
                            n.next = next;
                        }
                    }
                    None => self.buckets[bucket] = next,
                }
                self.free_node(idx);
                if self.buckets[bucket].is_none() {
                    self.used_buckets = self.used_buckets.saturating_sub(1);
                }
                return;
            }
            prev = Some(idx);
            cursor = next;
        }
    }

    fn find_entry_id(&self, desc: &FlowDescriptor) -> Option<usize> {
        let bucket = self.index_for(desc);
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            match &self.nodes[idx] {
                NodeSlot::Occupied(n) if n.desc == *desc => return Some(n.entry),
                NodeSlot::Occupied(n) => cursor = n.next,
                NodeSlot::Free(_) => unreachable!(),
            }
        }
        None
    }

    /// Inserts `value` under a single descriptor. Equivalent to
    /// `insert_dual(desc, None, value)`.
    pub fn insert(&mut self, desc: FlowDescriptor, value: T) -> Result<()> {
        self.insert_dual(desc, None, value)
    }

    /// Inserts `value` under `primary` and, if given, a `secondary`
    /// descriptor too — the dual-sided-NAT case from spec §3/§4.3, where an
    /// entry must be findable under either key. Returns `Err` if either
    /// descriptor is already claimed by a *different* entry (matching
    /// `insertFlow`'s `conflictsWith` check); re-inserting the exact same
    /// `(primary, secondary)` pair is a no-op replace of the value.
    pub fn insert_dual(&mut self, primary: FlowDescriptor, secondary: Option<FlowDescriptor>, value: T) -> Result<()> {
        if !primary.is_valid() {
            return Err(TermError::InvalidParameter("invalid primary flow descriptor".into()));
        }
        if let Some(sec) = secondary {
            if !sec.is_valid() {
                return Err(TermError::InvalidParameter("invalid secondary flow descriptor".into()));
            }
        }

        if let Some(entry_id) = self.find_entry_id(&primary) {
            let same = match &self.entries[entry_id] {
                EntrySlot::Occupied(rec) => rec.primary == primary && rec.secondary == secondary,
                EntrySlot::Free(_) => unreachable!(),
            };
            if !same {
                return Err(TermError::InvalidParameter("flow descriptor already in use by a different entry".into()));
            }
            if let EntrySlot::Occupied(rec) = &mut self.entries[entry_id] {
                rec.value = value;
            }
            return Ok(());
        }
        if let Some(sec) = secondary {
            if self.find_entry_id(&sec).is_some() {
                return Err(TermError::InvalidParameter("secondary flow descriptor already in use by a different entry".into()));
            }
        }

        let entry_id = self.alloc_entry(EntryRec { primary, secondary, value });
        self.link_node(primary, entry_id);
        if let Some(sec) = secondary {
            self.link_node(sec, entry_id);
        }
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, desc: &FlowDescriptor) -> Option<&T> {
        let entry_id = self.find_entry_id(desc)?;
        match &self.entries[entry_id] {
            EntrySlot::Occupied(rec) => Some(&rec.value),
            EntrySlot::Free(_) => None,
        }
    }

    pub fn get_mut(&mut self, desc: &FlowDescriptor) -> Option<&mut T> {
        let entry_id = self.find_entry_id(desc)?;
        match &mut self.entries[entry_id] {
            EntrySlot::Occupied(rec) => Some(&mut rec.value),
            EntrySlot::Free(_) => None,
        }
    }

    /// Looks up `desc`, optionally cleaning up expired entries encountered
    /// in the same bucket along the way (`ExpiryMode::ExpireFlows`).
    /// `is_expired` decides whether an entry should be evicted; `on_evict`
    /// is called once per evicted entry with its primary descriptor,
    /// secondary descriptor (if any) and value — it must not try to mutate
    /// the map itself, matching the "no self-delete from inside the
    /// callback" discipline this map enforces by construction.
    pub fn find_with_expiry(
        &mut self,
        desc: &FlowDescriptor,
        mode: ExpiryMode,
        mut is_expired: impl FnMut(&T) -> bool,
        mut on_evict: impl FnMut(FlowDescriptor, Option<FlowDescriptor>, T),
    ) -> Option<&mut T> {
        if mode == ExpiryMode::ExpireFlows {
            let bucket = self.index_for(desc);
            self.cleanup_bucket(bucket, &mut is_expired, &mut on_evict);
        }
        self.get_mut(desc)
    }

    /// Implements `cleanupFlows(bucketIdx)`: detach the whole bucket chain,
    /// then for each node either evict its entry (once, even if both of its
    /// nodes land in this same bucket) or relink it, restarting effectively
    /// in `DontExpireFlows` mode since nothing here recurses.
    fn cleanup_bucket(
        &mut self,
        bucket: usize,
        is_expired: &mut impl FnMut(&T) -> bool,
        on_evict: &mut impl FnMut(FlowDescriptor, Option<FlowDescriptor>, T),
    ) {
        let mut collected: Vec<(FlowDescriptor, usize)> = Vec::new();
        let mut cursor = self.buckets[bucket].take();
        while let Some(idx) = cursor {
            let (desc, entry, next) = match &self.nodes[idx] {
                NodeSlot::Occupied(n) => (n.desc, n.entry, n.next),
                NodeSlot::Free(_) => unreachable!(),
            };
            self.free_node(idx);
            collected.push((desc, entry));
            cursor = next;
        }
        if !collected.is_empty() {
            self.used_buckets = self.used_buckets.saturating_sub(1);
        }

        let mut expired_cache: HashMap<usize, bool> = HashMap::new();
        let mut evicted: HashSet<usize> = HashSet::new();

        for (desc_here, entry_id) in collected {
            let expired = *expired_cache
                .entry(entry_id)
                .or_insert_with(|| match &self.entries[entry_id] {
                    EntrySlot::Occupied(rec) => is_expired(&rec.value),
                    EntrySlot::Free(_) => false,
                });

            if !expired {
                self.link_node(desc_here, entry_id);
                continue;
            }
            if !evicted.insert(entry_id) {
                // Entry's other node was already evicted earlier in this
                // same bucket; this node is already detached, nothing left.
                continue;
            }
            let rec = self.take_entry(entry_id);
            if let Some(sec) = rec.secondary {
                let other = if desc_here == rec.primary { sec } else { rec.primary };
                self.unlink_node(&other, entry_id);
            }
            self.len -= 1;
            on_evict(rec.primary, rec.secondary, rec.value);
        }
    }

    /// Removes and returns the entry reachable under `desc`, if present.
    /// For a dual-key entry this unlinks both its descriptors' nodes,
    /// regardless of which one `desc` happens to be.
    pub fn remove(&mut self, desc: &FlowDescriptor) -> Option<T> {
        let entry_id = self.find_entry_id(desc)?;
        let rec = self.take_entry(entry_id);
        self.unlink_node(&rec.primary, entry_id);
        if let Some(sec) = rec.secondary {
            self.unlink_node(&sec, entry_id);
        }
        self.len -= 1;
        Some(rec.value)
    }

    /// Removes every entry, calling `on_evict` for each one once, matching
    /// `IpFlowMap::clearMap`'s "send removal signal to all flows".
    pub fn clear(&mut self, mut on_evict: impl FnMut(FlowDescriptor, Option<FlowDescriptor>, T)) {
        for bucket in self.buckets.iter_mut() {
            *bucket = None;
        }
        self.nodes.clear();
        self.node_free_head = None;
        let entries = std::mem::take(&mut self.entries);
        self.entry_free_head = None;
        for entry in entries {
            if let EntrySlot::Occupied(rec) = entry {
                on_evict(rec.primary, rec.secondary, rec.value);
            }
        }
        self.used_buckets = 0;
        self.len = 0;
    }

    /// Full-table sweep independent of any particular lookup, e.g. a
    /// periodic idle-flow pass driven by the owner loop. Visits each
    /// logical entry exactly once — a dual-key entry is shown to `decide`
    /// once even though it has nodes in up to two buckets.
    pub fn sweep(
        &mut self,
        mut decide: impl FnMut(&T) -> Eviction,
        mut on_evict: impl FnMut(FlowDescriptor, Option<FlowDescriptor>, T),
    ) {
        let ids: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, EntrySlot::Occupied(_)).then_some(i))
            .collect();

        for entry_id in ids {
            let should_evict = match &self.entries[entry_id] {
                EntrySlot::Occupied(rec) => matches!(decide(&rec.value), Eviction::EvictNow),
                EntrySlot::Free(_) => continue,
            };
            if !should_evict {
                continue;
            }
            let rec = self.take_entry(entry_id);
            self.unlink_node(&rec.primary, entry_id);
            if let Some(sec) = rec.secondary {
                self.unlink_node(&sec, entry_id);
            }
            self.len -= 1;
            on_evict(rec.primary, rec.secondary, rec.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn desc(port: u16) -> FlowDescriptor {
        FlowDescriptor::new_v4(6, Ipv4Addr::new(10, 0, 0, 1), port, Ipv4Addr::new(10, 0, 0, 2), 80)
    }

    fn secondary_desc(port: u16) -> FlowDescriptor {
        FlowDescriptor::new_v4(6, Ipv4Addr::new(192, 168, 0, 1), port, Ipv4Addr::new(192, 168, 0, 2), 80)
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut map: FlowMap<i32> = FlowMap::new(8).unwrap();
        map.insert(desc(1), 100).unwrap();
        assert_eq!(map.get(&desc(1)), Some(&100));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn reinsert_same_desc_replaces_value() {
        let mut map: FlowMap<i32> = FlowMap::new(8).unwrap();
        map.insert(desc(1), 100).unwrap();
        map.insert(desc(1), 200).unwrap();
        assert_eq!(map.get(&desc(1)), Some(&200));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_returns_value_and_shrinks_len() {
        let mut map: FlowMap<i32> = FlowMap::new(8).unwrap();
        map.insert(desc(1), 100).unwrap();
        assert_eq!(map.remove(&desc(1)), Some(100));
        assert_eq!(map.get(&desc(1)), None);
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn slot_reuse_after_remove() {
        let mut map: FlowMap<i32> = FlowMap::new(8).unwrap();
        map.insert(desc(1), 100).unwrap();
        map.remove(&desc(1)).unwrap();
        map.insert(desc(2), 200).unwrap();
        assert_eq!(map.get(&desc(2)), Some(&200));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn bucket_collisions_chain_correctly() {
        let mut map: FlowMap<i32> = FlowMap::new(8).unwrap();
        for p in 0..50u16 {
            map.insert(desc(p), p as i32).unwrap();
        }
        for p in 0..50u16 {
            assert_eq!(map.get(&desc(p)), Some(&(p as i32)));
        }
        assert_eq!(map.len(), 50);
    }

    #[test]
    fn find_with_expiry_evicts_and_calls_back() {
        let mut map: FlowMap<i32> = FlowMap::new(8).unwrap();
        map.insert(desc(1), 100).unwrap();
        map.insert(desc(2), 200).unwrap();

        let mut evicted = Vec::new();
        let found = map.find_with_expiry(
            &desc(2),
            ExpiryMode::ExpireFlows,
            |v| *v == 100,
            |d, s, v| evicted.push((d, s, v)),
        );
        assert_eq!(found, Some(&mut 200));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].1, None);
        assert_eq!(evicted[0].2, 100);
        assert_eq!(map.get(&desc(1)), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn clear_evicts_everything() {
        let mut map: FlowMap<i32> = FlowMap::new(8).unwrap();
        map.insert(desc(1), 100).unwrap();
        map.insert(desc(2), 200).unwrap();
        let mut evicted = Vec::new();
        map.clear(|d, s, v| evicted.push((d, s, v)));
        assert!(map.is_empty());
        assert_eq!(evicted.len(), 2);
    }

    #[test]
    fn rejects_out_of_range_bit_size() {
        assert!(FlowMap::<i32>::new(4).is_err());
        assert!(FlowMap::<i32>::new(31).is_err());
    }

    #[test]
    fn dual_key_entry_findable_under_both_descriptors() {
        let mut map: FlowMap<&'static str> = FlowMap::new(10).unwrap();
        let primary = desc(1234);
        let secondary = secondary_desc(1234);

        map.insert_dual(primary, Some(secondary), "nat-flow").unwrap();
        assert_eq!(map.get(&primary).copied(), Some("nat-flow"));
        assert_eq!(map.get(&secondary).copied(), Some("nat-flow"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn dual_key_remove_removes_both_descriptors() {
        let mut map: FlowMap<&'static str> = FlowMap::new(10).unwrap();
        let primary = desc(1234);
        let secondary = secondary_desc(1234);
        map.insert_dual(primary, Some(secondary), "nat-flow").unwrap();

        assert_eq!(map.remove(&primary), Some("nat-flow"));
        assert!(map.get(&primary).is_none());
        assert!(map.get(&secondary).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn dual_key_conflicting_secondary_is_rejected() {
        let mut map: FlowMap<i32> = FlowMap::new(10).unwrap();
        let primary_a = desc(1);
        let primary_b = desc(2);
        let shared_secondary = secondary_desc(999);

        map.insert_dual(primary_a, Some(shared_secondary), 1).unwrap();
        assert!(map.insert_dual(primary_b, Some(shared_secondary), 2).is_err());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn dual_key_entry_evicted_once_when_expiry_walks_either_bucket() {
        let mut map: FlowMap<i32> = FlowMap::new(10).unwrap();
        let primary = desc(1234);
        let secondary = secondary_desc(1234);
        map.insert_dual(primary, Some(secondary), 7).unwrap();

        let mut evicted = Vec::new();
        let found = map.find_with_expiry(&primary, ExpiryMode::ExpireFlows, |_| true, |d, s, v| evicted.push((d, s, v)));
        assert!(found.is_none());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].1, Some(secondary));
        assert!(map.get(&secondary).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn sweep_evicts_only_selected_entries_once_per_dual_key_flow() {
        let mut map: FlowMap<i32> = FlowMap::new(10).unwrap();
        let primary = desc(1234);
        let secondary = secondary_desc(1234);
        map.insert_dual(primary, Some(secondary), 1).unwrap();
        map.insert(desc(1), 2).unwrap();

        let mut evicted = Vec::new();
        map.sweep(
            |v| if *v == 1 { Eviction::EvictNow } else { Eviction::Retain },
            |d, s, v| evicted.push((d, s, v)),
        );

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].1, Some(secondary));
        assert!(map.get(&primary).is_none());
        assert!(map.get(&secondary).is_none());
        assert_eq!(map.get(&desc(1)), Some(&2));
        assert_eq!(map.len(), 1);
    }
}
