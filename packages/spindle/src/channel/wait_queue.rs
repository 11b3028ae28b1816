// queue of waiting channel operations.
//
// a doubly linked FIFO threaded through a slot arena. each entry is addressed by a key of its slot
// index plus that slot's stamp, which is bumped whenever the slot is freed, so an entry can be
// removed by key in O(1) and a stale key never matches a later occupant of the same slot.

use std::mem;


// key to a queued waiter.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct WaiterKey {
    idx: u32,
    stamp: u32,
}

pub(crate) struct WaitQueue<W> {
    slots: Vec<Slot<W>>,
    // head of the free list, threaded through free slots.
    free: Option<u32>,
    // front and back of queue, unless queue is empty.
    front_back: Option<(u32, u32)>,
    len: usize,
}

struct Slot<W> {
    stamp: u32,
    entry: Entry<W>,
}

enum Entry<W> {
    Linked {
        waiter: W,
        // next entry towards front.
        to_front: Option<u32>,
        // next entry towards back.
        to_back: Option<u32>,
    },
    Free {
        next_free: Option<u32>,
    },
}

impl<W> WaitQueue<W> {
    // construct empty queue.
    pub(crate) fn new() -> Self {
        WaitQueue {
            slots: Vec::new(),
            free: None,
            front_back: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    // link a waiter to the back of the queue.
    pub(crate) fn push_back(&mut self, waiter: W) -> WaiterKey {
        let entry = Entry::Linked {
            waiter,
            to_front: self.front_back.map(|(_, back)| back),
            to_back: None,
        };

        // take a free slot or grow
        let idx = match self.free {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                self.free = match &slot.entry {
                    &Entry::Free { next_free } => next_free,
                    Entry::Linked { .. } => unreachable!("linked slot in free list"),
                };
                slot.entry = entry;
                idx
            }
            None => {
                let idx = u32::try_from(self.slots.len()).expect("too many waiters");
                self.slots.push(Slot { stamp: 0, entry });
                idx
            }
        };

        // node becomes new back, and new to_back of previous back
        match self.front_back {
            Some((front, back)) => {
                *self.links(back).1 = Some(idx);
                self.front_back = Some((front, idx));
            }
            None => self.front_back = Some((idx, idx)),
        }
        self.len += 1;
        WaiterKey { idx, stamp: self.slots[idx as usize].stamp }
    }

    // unlink and return the waiter with the given key, unless it is no longer queued.
    pub(crate) fn remove(&mut self, key: WaiterKey) -> Option<W> {
        let slot = self.slots.get_mut(key.idx as usize)?;
        if slot.stamp != key.stamp || matches!(slot.entry, Entry::Free { .. }) {
            return None;
        }
        let entry = mem::replace(&mut slot.entry, Entry::Free { next_free: self.free });
        slot.stamp = slot.stamp.wrapping_add(1);
        self.free = Some(key.idx);
        self.len -= 1;

        let Entry::Linked { waiter, to_front, to_back } = entry
            else { unreachable!("checked linked above") };
        let (mut front, mut back) = self.front_back
            .expect("linked entry in empty queue");
        match to_front {
            Some(i) => *self.links(i).1 = to_back,
            // node was at the front, its to_back becomes new front
            None => front = to_back.unwrap_or(front),
        }
        match to_back {
            Some(i) => *self.links(i).0 = to_front,
            // node was at the back, its to_front becomes new back
            None => back = to_front.unwrap_or(back),
        }
        self.front_back = if self.len == 0 { None } else { Some((front, back)) };
        Some(waiter)
    }

    // unlink and return the front waiter.
    pub(crate) fn pop_front(&mut self) -> Option<(WaiterKey, W)> {
        let (front, _) = self.front_back?;
        let key = WaiterKey { idx: front, stamp: self.slots[front as usize].stamp };
        self.remove(key).map(|waiter| (key, waiter))
    }

    // to_front and to_back links of a linked entry.
    fn links(&mut self, idx: u32) -> (&mut Option<u32>, &mut Option<u32>) {
        match &mut self.slots[idx as usize].entry {
            Entry::Linked { to_front, to_back, .. } => (to_front, to_back),
            Entry::Free { .. } => unreachable!("free slot linked into queue"),
        }
    }
}
