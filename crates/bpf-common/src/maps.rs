//! Tables shared between kernel-side probe code and userspace.
//!
//! eBPF maps are the only memory both sides can touch. The protocols built on
//! top of them (path fragments, syscall correlation, statistics buffers) are
//! written against the traits in this module, so that the same code runs
//! against a real [`aya`] map or against the in-memory fakes used by tests.
//!
//! There is no locking discipline across the two sides: last write wins and a
//! key is either present-and-valid or absent.

use std::{
    borrow::BorrowMut,
    collections::{HashMap, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use aya::{
    Pod,
    maps::{Array, HashMap as BpfHashMap, MapData, PerCpuArray, PerCpuValues},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("key not found")]
    KeyNotFound,
    #[error("index {index} is out of bounds (max entries {max_entries})")]
    OutOfBounds { index: u32, max_entries: u32 },
    #[error("reading the number of possible cpus")]
    NrCpus(#[source] std::io::Error),
    #[error(transparent)]
    Bpf(aya::maps::MapError),
}

impl From<aya::maps::MapError> for MapError {
    fn from(err: aya::maps::MapError) -> Self {
        match err {
            aya::maps::MapError::KeyNotFound => MapError::KeyNotFound,
            err => MapError::Bpf(err),
        }
    }
}

/// A key/value table with hash semantics.
pub trait SharedMap<K, V> {
    fn get(&self, key: &K) -> Result<V, MapError>;
    fn put(&mut self, key: K, value: V) -> Result<(), MapError>;
    fn delete(&mut self, key: &K) -> Result<(), MapError>;
}

/// A table with a single slot.
pub trait SharedCell<V> {
    fn load(&self) -> Result<V, MapError>;
    fn store(&mut self, value: V) -> Result<(), MapError>;
}

/// An array where every index holds one value per possible CPU.
pub trait PerCpuTable<V> {
    /// Values of `index`, one per CPU.
    fn per_cpu(&self, index: u32) -> Result<Vec<V>, MapError>;
    /// Zero the slot of every CPU at `index`.
    fn reset(&mut self, index: u32) -> Result<(), MapError>;
}

impl<T, K, V> SharedMap<K, V> for BpfHashMap<T, K, V>
where
    T: BorrowMut<MapData>,
    K: Pod,
    V: Pod,
{
    fn get(&self, key: &K) -> Result<V, MapError> {
        Ok(BpfHashMap::get(self, key, 0)?)
    }

    fn put(&mut self, key: K, value: V) -> Result<(), MapError> {
        Ok(self.insert(key, value, 0)?)
    }

    fn delete(&mut self, key: &K) -> Result<(), MapError> {
        Ok(self.remove(key)?)
    }
}

impl<T, V> SharedCell<V> for Array<T, V>
where
    T: BorrowMut<MapData>,
    V: Pod,
{
    fn load(&self) -> Result<V, MapError> {
        Ok(Array::get(self, &0, 0)?)
    }

    fn store(&mut self, value: V) -> Result<(), MapError> {
        Ok(self.set(0, value, 0)?)
    }
}

impl<T, V> PerCpuTable<V> for PerCpuArray<T, V>
where
    T: BorrowMut<MapData>,
    V: Pod + Default,
{
    fn per_cpu(&self, index: u32) -> Result<Vec<V>, MapError> {
        let values = PerCpuArray::get(self, &index, 0)?;
        Ok(values.iter().copied().collect())
    }

    fn reset(&mut self, index: u32) -> Result<(), MapError> {
        let nr_cpus = aya::util::nr_cpus().map_err(|(_, err)| MapError::NrCpus(err))?;
        let zeroed = PerCpuValues::try_from(vec![V::default(); nr_cpus]).map_err(MapError::NrCpus)?;
        Ok(self.set(index, zeroed, 0)?)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`SharedMap`] with bounded capacity.
///
/// When full, inserting a new key evicts the oldest one, which is how the
/// LRU hash maps used by the probes behave under memory pressure.
/// Clones share the same table.
pub struct MemoryMap<K, V> {
    inner: Arc<Mutex<MemoryMapInner<K, V>>>,
}

struct MemoryMapInner<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K, V> Clone for MemoryMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> MemoryMap<K, V> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryMapInner {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: VecDeque::new(),
            })),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &K) -> bool {
        lock(&self.inner).entries.contains_key(key)
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SharedMap<K, V> for MemoryMap<K, V> {
    fn get(&self, key: &K) -> Result<V, MapError> {
        lock(&self.inner)
            .entries
            .get(key)
            .cloned()
            .ok_or(MapError::KeyNotFound)
    }

    fn put(&mut self, key: K, value: V) -> Result<(), MapError> {
        let mut inner = lock(&self.inner);
        if !inner.entries.contains_key(&key) {
            while inner.entries.len() >= inner.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            inner.order.push_back(key.clone());
        }
        inner.entries.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<(), MapError> {
        let mut inner = lock(&self.inner);
        inner.entries.remove(key).ok_or(MapError::KeyNotFound)?;
        inner.order.retain(|k| k != key);
        Ok(())
    }
}

/// In-memory [`SharedCell`]. Clones share the same slot.
pub struct MemoryCell<V> {
    inner: Arc<Mutex<V>>,
}

impl<V> Clone for MemoryCell<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone> MemoryCell<V> {
    pub fn new(value: V) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }
}

impl<V: Clone> SharedCell<V> for MemoryCell<V> {
    fn load(&self) -> Result<V, MapError> {
        Ok(lock(&self.inner).clone())
    }

    fn store(&mut self, value: V) -> Result<(), MapError> {
        *lock(&self.inner) = value;
        Ok(())
    }
}

/// In-memory [`PerCpuTable`]. Clones share the same slots.
pub struct MemoryPerCpuTable<V> {
    inner: Arc<Mutex<Vec<Vec<V>>>>,
}

impl<V> Clone for MemoryPerCpuTable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Default> MemoryPerCpuTable<V> {
    pub fn new(max_entries: u32, nr_cpus: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![
                vec![V::default(); nr_cpus];
                max_entries as usize
            ])),
        }
    }

    /// Update the slot of `cpu` at `index`, the way a probe running on that
    /// CPU would.
    pub fn increment(
        &self,
        cpu: usize,
        index: u32,
        update: impl FnOnce(&mut V),
    ) -> Result<(), MapError> {
        let mut inner = lock(&self.inner);
        let max_entries = inner.len() as u32;
        let slot = inner
            .get_mut(index as usize)
            .and_then(|cpus| cpus.get_mut(cpu))
            .ok_or(MapError::OutOfBounds { index, max_entries })?;
        update(slot);
        Ok(())
    }
}

impl<V: Clone + Default> PerCpuTable<V> for MemoryPerCpuTable<V> {
    fn per_cpu(&self, index: u32) -> Result<Vec<V>, MapError> {
        let inner = lock(&self.inner);
        inner
            .get(index as usize)
            .cloned()
            .ok_or(MapError::OutOfBounds {
                index,
                max_entries: inner.len() as u32,
            })
    }

    fn reset(&mut self, index: u32) -> Result<(), MapError> {
        let mut inner = lock(&self.inner);
        let max_entries = inner.len() as u32;
        let cpus = inner
            .get_mut(index as usize)
            .ok_or(MapError::OutOfBounds { index, max_entries })?;
        cpus.iter_mut().for_each(|slot| *slot = V::default());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_map_evicts_oldest_when_full() {
        let mut map = MemoryMap::with_capacity(2);
        map.put(1u32, "a").unwrap();
        map.put(2, "b").unwrap();
        map.put(3, "c").unwrap();
        assert!(matches!(map.get(&1), Err(MapError::KeyNotFound)));
        assert_eq!(map.get(&2).unwrap(), "b");
        assert_eq!(map.get(&3).unwrap(), "c");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn memory_map_overwrite_keeps_slot() {
        let mut map = MemoryMap::with_capacity(2);
        map.put(1u32, 10u32).unwrap();
        map.put(2, 20).unwrap();
        map.put(1, 11).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&1).unwrap(), 11);
    }

    #[test]
    fn memory_map_clones_share_entries() {
        let mut writer = MemoryMap::with_capacity(8);
        let mut reader = writer.clone();
        writer.put(7u32, 70u64).unwrap();
        assert_eq!(reader.get(&7).unwrap(), 70);
        reader.delete(&7).unwrap();
        assert!(!writer.contains_key(&7));
        assert!(matches!(reader.delete(&7), Err(MapError::KeyNotFound)));
    }

    #[test]
    fn per_cpu_table_reset_zeroes_every_cpu() {
        let mut table = MemoryPerCpuTable::<u64>::new(4, 2);
        table.increment(0, 3, |v| *v += 3).unwrap();
        table.increment(1, 3, |v| *v += 4).unwrap();
        assert_eq!(table.per_cpu(3).unwrap(), vec![3, 4]);
        table.reset(3).unwrap();
        assert_eq!(table.per_cpu(3).unwrap(), vec![0, 0]);
        assert!(matches!(
            table.per_cpu(4),
            Err(MapError::OutOfBounds { index: 4, .. })
        ));
    }
}
