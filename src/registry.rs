use std::sync::Arc;

/// Index into a [`Registry`] plus the generation the slot had when the entry
/// was inserted. A stale handle never resolves to a newer occupant.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub(crate) struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Packed form handed to the device. Generations start at 1, so the raw
    /// value of a live handle is never 0.
    pub(crate) fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation,
        })
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

pub(crate) struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Reserve a handle so the entry can embed it before insertion.
    pub(crate) fn reserve(&mut self) -> Handle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        Handle {
            index,
            generation: slot.generation,
        }
    }

    /// Fill a reserved handle. A handle that is no longer reserved is ignored.
    pub(crate) fn fill(&mut self, handle: Handle, value: Arc<T>) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation && slot.value.is_none() {
                slot.value = Some(value);
            }
        }
    }

    /// Give back a reserved handle whose entry was never filled.
    pub(crate) fn cancel(&mut self, handle: Handle) {
        if let Some(slot) = self.slots.get(handle.index as usize) {
            if slot.generation == handle.generation && slot.value.is_none() {
                self.free.push(handle.index);
            }
        }
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&Arc<T>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(handle.index);
        Some(value)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut reg = Registry::new();
        let h1 = reg.reserve();
        reg.fill(h1, Arc::new(1u32));
        assert_eq!(reg.get(h1).map(|v| **v), Some(1));

        assert!(reg.remove(h1).is_some());
        let h2 = reg.reserve();
        reg.fill(h2, Arc::new(2u32));

        assert_eq!(h1.index, h2.index);
        assert!(reg.get(h1).is_none());
        assert!(reg.remove(h1).is_none());
        assert_eq!(reg.get(h2).map(|v| **v), Some(2));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_raw_round_trip() {
        let mut reg: Registry<u32> = Registry::new();
        let h = reg.reserve();
        assert_ne!(h.to_raw(), 0);
        assert_eq!(Handle::from_raw(h.to_raw()), Some(h));
        assert_eq!(Handle::from_raw(0), None);
    }

    #[test]
    fn test_cancelled_reservation_is_reused() {
        let mut reg: Registry<u32> = Registry::new();
        let h1 = reg.reserve();
        reg.cancel(h1);
        let h2 = reg.reserve();
        assert_eq!(h1.index, h2.index);
        assert_ne!(h1.generation, h2.generation);
    }
}
