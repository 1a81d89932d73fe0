//! Fixed-identity object pool with a state tag per slot.
//!
//! Slots are never removed; releasing one only flips its tag back to
//! [`SlotState::Free`] so the stored object (a fence, for instance) can be
//! handed out again without reallocating it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Active,
}

#[derive(Debug)]
struct Slot<T> {
    value: T,
    state: SlotState,
}

#[derive(Debug)]
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    /// Indices of free slots, most recently released last
    free: Vec<usize>,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Reactivate a free slot, if there is one.
    pub fn acquire_free(&mut self) -> Option<usize> {
        let index = self.free.pop()?;
        self.slots[index].state = SlotState::Active;
        Some(index)
    }

    /// Store a new object, already active.
    pub fn insert_active(&mut self, value: T) -> usize {
        self.slots.push(Slot {
            value,
            state: SlotState::Active,
        });
        self.slots.len() - 1
    }

    /// Return an active slot to the free list. Releasing a free or unknown
    /// slot is a no-op and returns false.
    pub fn release(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.state == SlotState::Active => {
                slot.state = SlotState::Free;
                self.free.push(index);
                true
            }
            _ => false,
        }
    }

    /// Release every active slot for which `release` returns true. Returns how many
    /// slots were released.
    pub fn release_where<F>(&mut self, mut release: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut released = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Active && release(&slot.value) {
                slot.state = SlotState::Free;
                self.free.push(index);
                released += 1;
            }
        }
        released
    }

    /// Release every active slot.
    pub fn release_all(&mut self) -> usize {
        self.release_where(|_| true)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).map(|slot| &mut slot.value)
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    pub fn active(&self) -> impl Iterator<Item = &T> {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Active)
            .map(|slot| &slot.value)
    }

    /// Active objects together with their slot index.
    pub fn active_indexed(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::Active)
            .map(|(index, slot)| (index, &slot.value))
    }

    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Consume the slab, yielding every stored object regardless of state.
    pub fn into_values(self) -> impl Iterator<Item = T> {
        self.slots.into_iter().map(|slot| slot.value)
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}
