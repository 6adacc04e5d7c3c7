//! Shuffle and parallel reduce shared by the batch jobs.
//!
//! The map phase emits `(key, value)` pairs into a [`Shuffle`]; the reduce
//! phase hands every key with all of its values to exactly one worker thread.

use std::collections::BTreeMap;
use std::thread;

/// Values grouped by reduce key, in emission order.
#[derive(Debug)]
pub struct Shuffle<K, V> {
    groups: BTreeMap<K, Vec<V>>,
    emitted: usize,
}

impl<K: Ord, V> Shuffle<K, V> {
    pub fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
            emitted: 0,
        }
    }

    pub fn emit(&mut self, key: K, value: V) {
        self.groups.entry(key).or_default().push(value);
        self.emitted += 1;
    }

    /// Number of pairs emitted so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn key_count(&self) -> usize {
        self.groups.len()
    }

    pub fn into_groups(self) -> BTreeMap<K, Vec<V>> {
        self.groups
    }
}

impl<K: Ord, V> Default for Shuffle<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce every group on up to `workers` threads.
///
/// Keys are dealt round-robin, so each key is reduced by exactly one worker.
/// Output order follows the workers, not the keys.
pub fn reduce_parallel<K, V, R, F>(groups: BTreeMap<K, Vec<V>>, workers: usize, reduce: F) -> Vec<(K, R)>
where
    K: Send,
    V: Send,
    R: Send,
    F: Fn(&K, Vec<V>) -> R + Sync,
{
    let workers = workers.max(1);
    let mut partitions: Vec<Vec<(K, Vec<V>)>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, group) in groups.into_iter().enumerate() {
        partitions[i % workers].push(group);
    }

    let reduce = &reduce;
    thread::scope(|scope| {
        let handles: Vec<_> = partitions
            .into_iter()
            .filter(|partition| !partition.is_empty())
            .map(|partition| {
                scope.spawn(move || {
                    partition
                        .into_iter()
                        .map(|(key, values)| {
                            let out = reduce(&key, values);
                            (key, out)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}
