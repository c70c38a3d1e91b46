use std::fmt;

use serde::{Deserialize, Serialize};

/// Router-issued worker identity.
///
/// Slot indices are reused after an erase; the generation makes an id from before the erase
/// resolve to nothing instead of to the unrelated new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId {
    index: u32,
    generation: u32,
}

impl WorkerId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Arena of live workers: a growable slot array plus a free list of reclaimed indices.
#[derive(Debug)]
pub struct WorkerTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for WorkerTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> WorkerTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the value built by `make`, which receives the id the value will live under.
    pub fn insert_with(&mut self, make: impl FnOnce(WorkerId) -> T) -> WorkerId {
        let id = match self.free.pop() {
            Some(index) => {
                let generation = match &self.slots[index as usize] {
                    Slot::Vacant { generation } => *generation,
                    Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                WorkerId { index, generation }
            }
            None => {
                let index = u32::try_from(self.slots.len()).expect("worker table overflow");
                self.slots.push(Slot::Vacant { generation: 0 });
                WorkerId {
                    index,
                    generation: 0,
                }
            }
        };
        self.slots[id.index as usize] = Slot::Occupied {
            generation: id.generation,
            value: make(id),
        };
        self.len += 1;
        id
    }

    pub fn insert(&mut self, value: T) -> WorkerId {
        self.insert_with(|_| value)
    }

    pub fn get(&self, id: WorkerId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            generation: id.generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
            unreachable!("slot checked as occupied");
        };
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (WorkerId, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                WorkerId {
                    index: index as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (WorkerId, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    WorkerId {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.iter().map(|(id, _)| id).collect()
    }
}
