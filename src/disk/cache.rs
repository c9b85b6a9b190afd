//! The shared block read cache.
//!
//! This is a Window-TinyLFU cache (https://arxiv.org/pdf/1512.00727.pdf):
//! a small LRU window in front of a segmented LRU main cache, with a
//! frequency sketch deciding admission into the main cache.
//!
//! ```text
//!            window cache victim  .---------.  main cache victim
//!           .-------------------->| TinyLFU |<-----------------.
//!           |                     `---------'                  |
//!  .-------------------.               |    .------------------.
//!  | window cache (1%) |               |    | main cache (99%) |
//!  |       (LRU)       |               |    |      (SLRU)      |
//!  `-------------------'               |    `------------------'
//!           ^                          `--------------.
//!           |                                         v
//!        new entry                                  winner
//! ```
//!
//! New entries first land in the window, where they stay while they have
//! high temporal locality. An entry pushed out of the window gets a chance
//! to enter the main cache; if the cache is at capacity, the window victim
//! and the main cache's eviction candidate duel on their sketch frequencies
//! and the loser is dropped. The sketch periodically halves its counters so
//! that stale popularity ages out.
//!
//! The main cache is split into a probationary and a protected segment.
//! A hit in the probationary segment promotes the entry to the protected
//! MRU position; if the protected segment is over capacity, its LRU entry is
//! demoted back to the probationary MRU position, giving it another chance.
//!
//! Entries are stored in an index-keyed slab so that list relinking is pure
//! index manipulation. The cache is only ever accessed from the disk task.

use std::collections::HashMap;

use super::sketch::FrequencySketch;
use crate::{CachedBlock, PieceIndex, TorrentId};

/// Cached blocks are keyed by their exact location within the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub torrent: TorrentId,
    pub piece: PieceIndex,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment {
    Window,
    Probationary,
    Protected,
}

/// A cache entry, linked into the LRU list of its segment.
struct Node {
    key: CacheKey,
    data: CachedBlock,
    segment: Segment,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An LRU list over the slab: the head is the most, the tail the least
/// recently used entry.
#[derive(Default)]
struct LruList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    capacity: usize,
}

impl LruList {
    fn push_front(&mut self, slots: &mut [Option<Node>], index: usize) {
        {
            let node = slots[index].as_mut().expect("cache slot empty");
            node.prev = None;
            node.next = self.head;
        }
        if let Some(head) = self.head {
            slots[head].as_mut().expect("cache slot empty").prev =
                Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
        self.len += 1;
    }

    fn unlink(&mut self, slots: &mut [Option<Node>], index: usize) {
        let (prev, next) = {
            let node = slots[index].as_ref().expect("cache slot empty");
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => {
                slots[prev].as_mut().expect("cache slot empty").next = next
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                slots[next].as_mut().expect("cache slot empty").prev = prev
            }
            None => self.tail = prev,
        }
        self.len -= 1;
    }
}

pub(crate) struct BlockCache {
    /// Maps keys to their slab slot.
    map: HashMap<CacheKey, usize>,
    /// The slab holding all entries. Slots are stable: an entry never moves
    /// while resident.
    slots: Vec<Option<Node>>,
    /// Indices of vacated slots, reused before the slab grows.
    free: Vec<usize>,
    window: LruList,
    probationary: LruList,
    protected: LruList,
    sketch: FrequencySketch<CacheKey>,
}

impl BlockCache {
    /// Creates a cache that holds at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let (window, protected, probationary) = Self::segment_caps(capacity);
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            window: LruList {
                capacity: window,
                ..Default::default()
            },
            probationary: LruList {
                capacity: probationary,
                ..Default::default()
            },
            protected: LruList {
                capacity: protected,
                ..Default::default()
            },
            sketch: FrequencySketch::new(capacity),
        }
    }

    /// The window is 1% of the capacity (at least one entry); of the
    /// remainder, 80% is protected and 20% probationary.
    fn segment_caps(capacity: usize) -> (usize, usize, usize) {
        let window = ((capacity + 99) / 100).max(1);
        let main = capacity - window;
        let protected = main * 8 / 10;
        (window, protected, main - protected)
    }

    pub fn len(&self) -> usize {
        self.window.len + self.probationary.len + self.protected.len
    }

    pub fn capacity(&self) -> usize {
        self.window.capacity
            + self.probationary.capacity
            + self.protected.capacity
    }

    /// Looks up a block, recording the access in the frequency sketch and
    /// refreshing the entry's position in its segment.
    pub fn get(&mut self, key: &CacheKey) -> Option<CachedBlock> {
        self.sketch.record_access(key);
        let index = *self.map.get(key)?;
        self.handle_hit(index);
        Some(
            self.slots[index]
                .as_ref()
                .expect("cache slot empty")
                .data
                .clone(),
        )
    }

    /// Inserts a block, evicting per the admission policy if the cache is
    /// full. Inserting an already cached key refreshes its data and counts
    /// as a hit.
    pub fn insert(&mut self, key: CacheKey, data: CachedBlock) {
        if let Some(&index) = self.map.get(&key) {
            self.slots[index].as_mut().expect("cache slot empty").data =
                data;
            self.handle_hit(index);
            return;
        }

        self.sketch.record_access(&key);
        if self.window.len >= self.window.capacity {
            self.make_room_in_window();
        }
        let index = self.alloc(Node {
            key,
            data,
            segment: Segment::Window,
            prev: None,
            next: None,
        });
        self.window.push_front(&mut self.slots, index);
        self.map.insert(key, index);
    }

    /// Drops a single entry, if present.
    pub fn erase(&mut self, key: &CacheKey) {
        if let Some(index) = self.map.remove(key) {
            let segment = self.slots[index]
                .as_ref()
                .expect("cache slot empty")
                .segment;
            self.unlink_from(segment, index);
            self.release(index);
        }
    }

    /// Drops every entry belonging to the given torrent. Used when a
    /// torrent's files are erased or the torrent is removed.
    pub fn erase_torrent(&mut self, torrent: TorrentId) {
        let keys: Vec<_> = self
            .map
            .keys()
            .filter(|key| key.torrent == torrent)
            .copied()
            .collect();
        for key in keys {
            self.erase(&key);
        }
    }

    /// Changes the cache's total capacity, evicting as needed.
    ///
    /// The frequency sketch is rebuilt, so admission accuracy suffers until
    /// enough new history is gathered.
    pub fn change_capacity(&mut self, capacity: usize) {
        let capacity = capacity.max(2);
        let (window, protected, probationary) = Self::segment_caps(capacity);
        self.window.capacity = window;
        self.protected.capacity = protected;
        self.probationary.capacity = probationary;
        self.sketch.change_capacity(capacity);

        // excess window entries get their usual chance in the main cache
        while self.window.len > self.window.capacity {
            self.make_room_in_window();
        }
        // demote protected overflow, then shrink from the probationary tail
        while self.protected.len > self.protected.capacity {
            let demoted = self.protected.tail.expect("protected list empty");
            self.protected.unlink(&mut self.slots, demoted);
            self.slots[demoted]
                .as_mut()
                .expect("cache slot empty")
                .segment = Segment::Probationary;
            self.probationary.push_front(&mut self.slots, demoted);
        }
        while self.len() > self.capacity() {
            let victim = self
                .probationary
                .tail
                .or(self.window.tail)
                .expect("cache over capacity but no victim");
            self.evict(victim);
        }
    }

    fn handle_hit(&mut self, index: usize) {
        let segment = self.slots[index]
            .as_ref()
            .expect("cache slot empty")
            .segment;
        match segment {
            Segment::Window => {
                self.window.unlink(&mut self.slots, index);
                self.window.push_front(&mut self.slots, index);
            }
            Segment::Protected => {
                self.protected.unlink(&mut self.slots, index);
                self.protected.push_front(&mut self.slots, index);
            }
            Segment::Probationary => {
                // promote to protected; the protected LRU entry is demoted
                // back to probationary if the segment is over capacity
                self.probationary.unlink(&mut self.slots, index);
                self.slots[index]
                    .as_mut()
                    .expect("cache slot empty")
                    .segment = Segment::Protected;
                self.protected.push_front(&mut self.slots, index);
                if self.protected.len > self.protected.capacity {
                    let demoted =
                        self.protected.tail.expect("protected list empty");
                    self.protected.unlink(&mut self.slots, demoted);
                    self.slots[demoted]
                        .as_mut()
                        .expect("cache slot empty")
                        .segment = Segment::Probationary;
                    self.probationary.push_front(&mut self.slots, demoted);
                }
            }
        }
    }

    /// Makes room for a new window entry by either transferring the window
    /// victim into the main cache or, if the cache is at capacity, playing
    /// the admission duel between the window victim and the main cache's
    /// eviction candidate.
    fn make_room_in_window(&mut self) {
        let window_victim = match self.window.tail {
            Some(index) => index,
            None => return,
        };

        if self.len() >= self.capacity() {
            let main_victim = match self.probationary.tail {
                Some(index) => index,
                None => {
                    // no main cache candidate to duel with
                    self.evict(window_victim);
                    return;
                }
            };
            let window_victim_freq = self.sketch.frequency(
                &self.slots[window_victim]
                    .as_ref()
                    .expect("cache slot empty")
                    .key,
            );
            let main_victim_freq = self.sketch.frequency(
                &self.slots[main_victim]
                    .as_ref()
                    .expect("cache slot empty")
                    .key,
            );
            if window_victim_freq > main_victim_freq {
                self.evict(main_victim);
                self.admit_to_probationary(window_victim);
            } else {
                self.evict(window_victim);
            }
        } else {
            self.admit_to_probationary(window_victim);
        }
    }

    /// Moves the window victim to the probationary MRU position.
    fn admit_to_probationary(&mut self, index: usize) {
        self.window.unlink(&mut self.slots, index);
        self.slots[index]
            .as_mut()
            .expect("cache slot empty")
            .segment = Segment::Probationary;
        self.probationary.push_front(&mut self.slots, index);
    }

    /// Removes the entry from its segment, the key map, and the slab.
    fn evict(&mut self, index: usize) {
        let (key, segment) = {
            let node = self.slots[index].as_ref().expect("cache slot empty");
            (node.key, node.segment)
        };
        self.unlink_from(segment, index);
        self.map.remove(&key);
        self.release(index);
    }

    fn unlink_from(&mut self, segment: Segment, index: usize) {
        match segment {
            Segment::Window => self.window.unlink(&mut self.slots, index),
            Segment::Probationary => {
                self.probationary.unlink(&mut self.slots, index)
            }
            Segment::Protected => {
                self.protected.unlink(&mut self.slots, index)
            }
        }
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                index
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize) {
        self.slots[index] = None;
        self.free.push(index);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::disk::buffer::DiskBuffer;

    fn key(offset: u32) -> CacheKey {
        CacheKey {
            torrent: 0,
            piece: 0,
            offset,
        }
    }

    fn block() -> CachedBlock {
        Arc::new(DiskBuffer::unpooled(vec![0; 16]))
    }

    fn segment_of(cache: &BlockCache, key: &CacheKey) -> Option<Segment> {
        let index = *cache.map.get(key)?;
        Some(cache.slots[index].as_ref().unwrap().segment)
    }

    /// Walks a segment's list front to back, checking link consistency, and
    /// returns the number of entries seen.
    fn walk(cache: &BlockCache, list: &LruList) -> usize {
        let mut count = 0;
        let mut prev = None;
        let mut cursor = list.head;
        while let Some(index) = cursor {
            let node = cache.slots[index].as_ref().unwrap();
            assert_eq!(node.prev, prev);
            prev = Some(index);
            cursor = node.next;
            count += 1;
        }
        assert_eq!(list.tail, prev);
        assert_eq!(count, list.len);
        count
    }

    fn assert_invariants(cache: &BlockCache) {
        assert!(cache.len() <= cache.capacity());
        let total = walk(cache, &cache.window)
            + walk(cache, &cache.probationary)
            + walk(cache, &cache.protected);
        // every key is reachable from exactly one segment's list
        assert_eq!(total, cache.map.len());
        assert!(cache.protected.len <= cache.protected.capacity);
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = BlockCache::new(10);
        assert!(cache.get(&key(0)).is_none());

        cache.insert(key(0), block());
        assert!(cache.get(&key(0)).is_some());
        assert_eq!(cache.len(), 1);
        assert_invariants(&cache);
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let mut cache = BlockCache::new(20);
        for offset in 0..1000 {
            cache.insert(key(offset), block());
            assert_invariants(&cache);
        }
        assert!(cache.len() <= 20);
    }

    #[test]
    fn test_probationary_hit_promotes_to_protected() {
        let mut cache = BlockCache::new(100);
        cache.insert(key(0), block());
        // a second insert pushes key 0 out of the one entry window into
        // the probationary segment
        cache.insert(key(1), block());
        assert_eq!(segment_of(&cache, &key(0)), Some(Segment::Probationary));

        assert!(cache.get(&key(0)).is_some());
        assert_eq!(segment_of(&cache, &key(0)), Some(Segment::Protected));
        assert_invariants(&cache);
    }

    #[test]
    fn test_protected_overflow_demotes_lru() {
        // capacity 10: window 1, main 9: protected 7, probationary 2
        let mut cache = BlockCache::new(10);
        for offset in 0..9 {
            cache.insert(key(offset), block());
        }
        // promote eight entries; the first promoted one must be demoted
        // when the protected segment overflows
        for offset in 0..8 {
            assert!(cache.get(&key(offset)).is_some());
        }
        assert_eq!(segment_of(&cache, &key(0)), Some(Segment::Probationary));
        assert_eq!(segment_of(&cache, &key(7)), Some(Segment::Protected));
        assert_invariants(&cache);
    }

    // The admission scenario: a cache of 100, 200 distinct keys inserted
    // once, then one key re-accessed repeatedly. The hot key must end up
    // protected, and further one-hit wonders must not evict it.
    #[test]
    fn test_admission_protects_frequent_key() {
        let mut cache = BlockCache::new(100);
        for offset in 0..200 {
            cache.insert(key(offset), block());
        }
        assert!(cache.get(&key(0)).is_some(), "hot key evicted early");
        for _ in 0..10 {
            assert!(cache.get(&key(0)).is_some());
        }
        assert_eq!(segment_of(&cache, &key(0)), Some(Segment::Protected));

        for offset in 200..260 {
            cache.insert(key(offset), block());
        }
        assert!(cache.get(&key(0)).is_some());
        assert_eq!(segment_of(&cache, &key(0)), Some(Segment::Protected));
        assert_invariants(&cache);
    }

    #[test]
    fn test_change_capacity() {
        let mut cache = BlockCache::new(100);
        for offset in 0..100 {
            cache.insert(key(offset), block());
        }
        // promote some entries to protected
        for offset in 0..50 {
            cache.get(&key(offset));
        }

        cache.change_capacity(10);
        assert!(cache.len() <= cache.capacity());
        assert_invariants(&cache);

        // growing retains residents and restores headroom
        cache.change_capacity(50);
        assert_invariants(&cache);
        for offset in 300..330 {
            cache.insert(key(offset), block());
        }
        assert_invariants(&cache);
    }

    #[test]
    fn test_erase_torrent() {
        let mut cache = BlockCache::new(10);
        cache.insert(key(0), block());
        cache.insert(
            CacheKey {
                torrent: 1,
                piece: 0,
                offset: 0,
            },
            block(),
        );
        cache.erase_torrent(0);
        assert!(cache.get(&key(0)).is_none());
        assert_eq!(cache.len(), 1);
        assert_invariants(&cache);
    }
}
