//! Binary min-heap with stable handles and O(log n) external removal.
//!
//! The timer clock needs to cancel an arbitrary armed deadline without
//! scanning, so every heap entry keeps its current heap position in a slot
//! table and every sift updates the back-pointer. Handles are generational:
//! a handle to an entry that was popped or removed (and whose slot was
//! reused) is rejected instead of touching the new occupant.

/// Handle to a heap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId {
    index: u32,
    generation: u32,
}

struct HeapSlot<T> {
    generation: u32,
    /// Position in `order`, meaningful only while occupied.
    position: usize,
    entry: Option<(u64, T)>,
}

/// Min-heap of `(key, value)` entries ordered by `key`.
///
/// `insert`/`remove` are O(log n), `peek` is O(1). The heap property
/// (`parent.key <= child.key`) holds between public calls.
pub struct IndexedHeap<T> {
    slots: Vec<HeapSlot<T>>,
    free: Vec<u32>,
    /// Heap-ordered slot indices.
    order: Vec<u32>,
}

impl<T> IndexedHeap<T> {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when the heap holds no entries.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert an entry, returning a handle usable for removal.
    pub fn insert(&mut self, key: u64, value: T) -> HeapId {
        let position = self.order.len();
        let index = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.position = position;
            slot.entry = Some((key, value));
            index
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(HeapSlot {
                generation: 0,
                position,
                entry: Some((key, value)),
            });
            index
        };
        self.order.push(index);
        self.sift_up(position);
        HeapId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Smallest entry, if any, with its handle.
    pub fn peek(&self) -> Option<(u64, &T, HeapId)> {
        let index = *self.order.first()?;
        let slot = &self.slots[index as usize];
        let (key, value) = slot.entry.as_ref().expect("heap slot in order is occupied");
        Some((
            *key,
            value,
            HeapId {
                index,
                generation: slot.generation,
            },
        ))
    }

    /// Remove and return the smallest entry.
    pub fn pop(&mut self) -> Option<(u64, T)> {
        let index = *self.order.first()?;
        self.detach(index as usize, 0)
    }

    /// Remove the entry behind `id`, if it is still in the heap.
    pub fn remove(&mut self, id: HeapId) -> Option<(u64, T)> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation || slot.entry.is_none() {
            return None;
        }
        let position = slot.position;
        self.detach(id.index as usize, position)
    }

    fn detach(&mut self, slot_index: usize, position: usize) -> Option<(u64, T)> {
        let last = self.order.len() - 1;
        self.order.swap(position, last);
        self.order.pop();
        if position < self.order.len() {
            let moved = self.order[position] as usize;
            self.slots[moved].position = position;
            // The swapped-in entry may violate the property in either
            // direction relative to its new neighborhood.
            self.sift_down(position);
            self.sift_up(position);
        }

        let slot = &mut self.slots[slot_index];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(slot_index as u32);
        slot.entry.take()
    }

    fn key_at(&self, position: usize) -> u64 {
        let index = self.order[position] as usize;
        self.slots[index].entry.as_ref().expect("occupied").0
    }

    fn place(&mut self, position: usize, slot_index: u32) {
        self.order[position] = slot_index;
        self.slots[slot_index as usize].position = position;
    }

    fn sift_up(&mut self, mut position: usize) {
        let moving = self.order[position];
        let key = self.key_at(position);
        while position > 0 {
            let parent = (position - 1) / 2;
            if self.key_at(parent) <= key {
                break;
            }
            let parent_slot = self.order[parent];
            self.place(position, parent_slot);
            position = parent;
        }
        self.place(position, moving);
    }

    fn sift_down(&mut self, mut position: usize) {
        let len = self.order.len();
        if position >= len {
            return;
        }
        let moving = self.order[position];
        let key = self.key_at(position);
        loop {
            let mut child = 2 * position + 1;
            if child >= len {
                break;
            }
            if child + 1 < len && self.key_at(child + 1) < self.key_at(child) {
                child += 1;
            }
            if self.key_at(child) >= key {
                break;
            }
            let child_slot = self.order[child];
            self.place(position, child_slot);
            position = child;
        }
        self.place(position, moving);
    }
}

impl<T> Default for IndexedHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_heap_property<T>(heap: &IndexedHeap<T>) {
        for position in 1..heap.order.len() {
            let parent = (position - 1) / 2;
            assert!(
                heap.key_at(parent) <= heap.key_at(position),
                "heap property violated at position {}",
                position
            );
        }
    }

    #[test]
    fn test_pop_yields_ascending_keys() {
        let mut heap = IndexedHeap::new();
        for key in [9u64, 3, 7, 1, 8, 2, 6, 0, 5, 4] {
            heap.insert(key, key as usize);
            assert_heap_property(&heap);
        }

        let mut out = Vec::new();
        while let Some((key, _)) = heap.pop() {
            out.push(key);
            assert_heap_property(&heap);
        }
        assert_eq!(out, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_remove_by_handle() {
        let mut heap = IndexedHeap::new();
        let ids: Vec<_> = (0..22u64).map(|k| heap.insert(5 * k, k)).collect();

        assert_eq!(heap.remove(ids[8]), Some((40, 8)));
        assert_eq!(heap.remove(ids[17]), Some((85, 17)));
        assert_heap_property(&heap);

        // Second removal through the same handle must fail.
        assert_eq!(heap.remove(ids[8]), None);

        let mut remaining = Vec::new();
        while let Some((_, value)) = heap.pop() {
            remaining.push(value);
        }
        assert_eq!(remaining.len(), 20);
        assert!(!remaining.contains(&8));
        assert!(!remaining.contains(&17));
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut heap = IndexedHeap::new();
        let a = heap.insert(10, "a");
        heap.pop();

        let b = heap.insert(20, "b");
        assert_eq!(heap.remove(a), None);
        assert_eq!(heap.remove(b), Some((20, "b")));
    }

    #[test]
    fn test_duplicate_keys() {
        let mut heap = IndexedHeap::new();
        for value in 0..6 {
            heap.insert(7, value);
        }
        let mut count = 0;
        while let Some((key, _)) = heap.pop() {
            assert_eq!(key, 7);
            count += 1;
        }
        assert_eq!(count, 6);
    }

    #[test]
    fn test_interleaved_insert_remove_keeps_order() {
        let mut heap = IndexedHeap::new();
        let mut ids = Vec::new();
        for key in (0..64u64).rev() {
            ids.push(heap.insert(key, ()));
        }
        for id in ids.iter().step_by(3) {
            heap.remove(*id);
            assert_heap_property(&heap);
        }
        let mut last = 0;
        while let Some((key, _)) = heap.pop() {
            assert!(key >= last);
            last = key;
        }
    }
}
