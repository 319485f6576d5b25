//! Storage for per-slot frame resources

use crate::backend::traits::BackendResult;

/// One value per frame-in-flight slot.
///
/// Slot `i` is only touched while frame `n` with `n % len == i` is being
/// recorded, after that slot's fence has been waited on.
#[derive(Debug)]
pub struct PerFrame<T> {
    slots: Vec<T>,
}

impl<T> PerFrame<T> {
    /// Build `count` slots, stopping at the first failure
    pub fn try_new(
        count: usize,
        mut create: impl FnMut(usize) -> BackendResult<T>,
    ) -> BackendResult<Self> {
        let slots = (0..count).map(&mut create).collect::<BackendResult<Vec<_>>>()?;
        Ok(Self { slots })
    }

    pub fn get(&self, slot: usize) -> &T {
        &self.slots[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut T {
        &mut self.slots[slot]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }

    /// Take every slot out, for teardown
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;

    #[test]
    fn test_try_new_stops_at_failure() {
        let mut created = 0;
        let result = PerFrame::try_new(3, |slot| {
            if slot == 1 {
                return Err(BackendError::OutOfMemory);
            }
            created += 1;
            Ok(slot)
        });
        assert!(result.is_err());
        assert_eq!(created, 1);
    }

    #[test]
    fn test_slots_are_indexed() {
        let mut frames = PerFrame::try_new(2, |slot| Ok(slot * 10)).unwrap();
        *frames.get_mut(1) += 1;
        assert_eq!(frames.iter().copied().collect::<Vec<_>>(), vec![0, 11]);
        assert_eq!(frames.drain().count(), 2);
        assert!(frames.is_empty());
    }
}
