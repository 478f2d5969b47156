//! Persistent, per-chain queue of jobs blocked on unmet dependency IDs.
//!
//! A job is a small record (entity ID, kind tag, payload) plus the set of
//! dependency IDs that must land before it may run. Jobs with no missing
//! dependencies queue FIFO; `fulfill` releases jobs as their dependencies
//! land, in dependency order with ties broken by ID byte order. The record
//! store and the runnable order are persisted before a push is acknowledged,
//! and a popped job is deleted before it runs, so across a crash every job
//! runs at most once and ready jobs re-fire in the same order.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// Errors from the job queue.
#[derive(Clone, Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue I/O error: {0}")]
    Io(String),
    #[error("job record corrupt: {0}")]
    Corrupt(String),
}

/// A deferred unit of work. The queue never interprets `kind` or `payload`;
/// the owner dispatches on them at execution time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// The ID this job produces; fulfilling it may release other jobs.
    pub id: Id,
    pub kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredJob {
    record: JobRecord,
    missing: Vec<Id>,
}

const JOB_PREFIX: &[u8] = b"j/";
const RUN_PREFIX: &[u8] = b"r/";

fn job_key(id: &Id) -> Vec<u8> {
    let mut key = Vec::with_capacity(JOB_PREFIX.len() + 32);
    key.extend_from_slice(JOB_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

fn run_key(seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(RUN_PREFIX.len() + 8);
    key.extend_from_slice(RUN_PREFIX);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// The dependency-blocked job queue.
pub struct JobQueue {
    tree: sled::Tree,
    /// dep ID → jobs waiting on it.
    blocked_by: HashMap<Id, HashSet<Id>>,
    /// job ID → its unmet deps.
    missing: HashMap<Id, HashSet<Id>>,
    records: HashMap<Id, JobRecord>,
    /// (persisted seq, job) in FIFO order.
    runnable: VecDeque<(u64, Id)>,
    next_seq: u64,
}

impl JobQueue {
    /// Open the queue over `tree`, restoring persisted jobs. `resolve`
    /// recomputes each blocked job's missing dependencies against current
    /// state (dependencies may have landed since the crash).
    pub fn open(
        tree: sled::Tree,
        mut resolve: impl FnMut(&JobRecord) -> HashSet<Id>,
    ) -> Result<Self, QueueError> {
        let mut queue = JobQueue {
            tree,
            blocked_by: HashMap::new(),
            missing: HashMap::new(),
            records: HashMap::new(),
            runnable: VecDeque::new(),
            next_seq: 0,
        };

        // Runnable entries first, in their persisted order.
        let mut runnable_ids = HashSet::new();
        for entry in queue.tree.scan_prefix(RUN_PREFIX) {
            let (key, value) = entry.map_err(|e| QueueError::Io(e.to_string()))?;
            let seq = u64::from_be_bytes(
                key[RUN_PREFIX.len()..]
                    .try_into()
                    .map_err(|_| QueueError::Corrupt("runnable key".into()))?,
            );
            let id = Id::from_slice(&value).map_err(|e| QueueError::Corrupt(e.to_string()))?;
            queue.runnable.push_back((seq, id));
            runnable_ids.insert(id);
            queue.next_seq = queue.next_seq.max(seq + 1);
        }

        // Blocked jobs re-derive their missing sets; any that became ready
        // while down are appended after the persisted runnable order.
        let mut became_ready = Vec::new();
        for entry in queue.tree.scan_prefix(JOB_PREFIX) {
            let (_, value) = entry.map_err(|e| QueueError::Io(e.to_string()))?;
            let stored: StoredJob =
                bincode::deserialize(&value).map_err(|e| QueueError::Corrupt(e.to_string()))?;
            let id = stored.record.id;
            queue.records.insert(id, stored.record.clone());
            if runnable_ids.contains(&id) {
                continue;
            }
            let missing = resolve(&stored.record);
            if missing.is_empty() {
                became_ready.push(id);
            } else {
                for dep in &missing {
                    queue.blocked_by.entry(*dep).or_default().insert(id);
                }
                queue.missing.insert(id, missing);
            }
        }
        became_ready.sort_unstable();
        for id in became_ready {
            queue.persist_runnable(id)?;
        }
        Ok(queue)
    }

    fn persist_record(&self, record: &JobRecord, missing: &HashSet<Id>) -> Result<(), QueueError> {
        let stored = StoredJob {
            record: record.clone(),
            missing: missing.iter().copied().collect(),
        };
        let bytes = bincode::serialize(&stored).map_err(|e| QueueError::Io(e.to_string()))?;
        self.tree
            .insert(job_key(&record.id), bytes)
            .map(|_| ())
            .map_err(|e| QueueError::Io(e.to_string()))
    }

    fn persist_runnable(&mut self, id: Id) -> Result<(), QueueError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tree
            .insert(run_key(seq), id.as_bytes().as_slice())
            .map_err(|e| QueueError::Io(e.to_string()))?;
        self.runnable.push_back((seq, id));
        Ok(())
    }

    /// Add a job. Returns false (and stores nothing) if a job with this ID
    /// is already queued. The record is durable before this returns.
    pub fn push(&mut self, record: JobRecord, missing: HashSet<Id>) -> Result<bool, QueueError> {
        if self.records.contains_key(&record.id) {
            return Ok(false);
        }
        self.persist_record(&record, &missing)?;
        let id = record.id;
        self.records.insert(id, record);
        if missing.is_empty() {
            self.persist_runnable(id)?;
        } else {
            for dep in &missing {
                self.blocked_by.entry(*dep).or_default().insert(id);
            }
            self.missing.insert(id, missing);
        }
        Ok(true)
    }

    /// Record that `id` has landed. Jobs whose last dependency this was
    /// become runnable, in ID order. Returns how many were released.
    pub fn fulfill(&mut self, id: &Id) -> Result<usize, QueueError> {
        let Some(waiting) = self.blocked_by.remove(id) else {
            return Ok(0);
        };
        let mut released = Vec::new();
        for job_id in waiting {
            let Some(missing) = self.missing.get_mut(&job_id) else {
                continue;
            };
            missing.remove(id);
            if missing.is_empty() {
                self.missing.remove(&job_id);
                released.push(job_id);
            }
        }
        released.sort_unstable();
        let count = released.len();
        for job_id in released {
            self.persist_runnable(job_id)?;
        }
        Ok(count)
    }

    /// Drop every job transitively blocked on `id` and return their
    /// records so the owner can mark them failed.
    pub fn abandon(&mut self, id: &Id) -> Result<Vec<JobRecord>, QueueError> {
        let mut doomed = Vec::new();
        let mut stack = vec![*id];
        while let Some(dep) = stack.pop() {
            let Some(waiting) = self.blocked_by.remove(&dep) else {
                continue;
            };
            let mut ordered: Vec<Id> = waiting.into_iter().collect();
            ordered.sort_unstable();
            for job_id in ordered {
                if let Some(record) = self.remove_job(&job_id)? {
                    doomed.push(record);
                    // This job's output will never land either.
                    stack.push(job_id);
                }
            }
        }
        Ok(doomed)
    }

    fn remove_job(&mut self, id: &Id) -> Result<Option<JobRecord>, QueueError> {
        let Some(record) = self.records.remove(id) else {
            return Ok(None);
        };
        if let Some(missing) = self.missing.remove(id) {
            for dep in missing {
                if let Some(set) = self.blocked_by.get_mut(&dep) {
                    set.remove(id);
                    if set.is_empty() {
                        self.blocked_by.remove(&dep);
                    }
                }
            }
        }
        self.tree
            .remove(job_key(id))
            .map_err(|e| QueueError::Io(e.to_string()))?;
        Ok(Some(record))
    }

    /// Pop the next runnable job. The record and its queue entry are
    /// deleted in one batch before it is returned, so it will run at most
    /// once even across a crash.
    pub fn pop_runnable(&mut self) -> Result<Option<JobRecord>, QueueError> {
        while let Some((seq, id)) = self.runnable.pop_front() {
            let Some(record) = self.records.remove(&id) else {
                // Stale entry; drop it and keep going.
                self.tree
                    .remove(run_key(seq))
                    .map_err(|e| QueueError::Io(e.to_string()))?;
                continue;
            };
            let mut batch = sled::Batch::default();
            batch.remove(run_key(seq));
            batch.remove(job_key(&id));
            self.tree
                .apply_batch(batch)
                .map_err(|e| QueueError::Io(e.to_string()))?;
            return Ok(Some(record));
        }
        Ok(None)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.records.contains_key(id)
    }

    /// Jobs still waiting on at least one dependency.
    pub fn blocked_len(&self) -> usize {
        self.missing.len()
    }

    pub fn runnable_len(&self) -> usize {
        self.runnable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tree(db: &sled::Db, name: &str) -> sled::Tree {
        db.open_tree(name).unwrap()
    }

    fn record(b: u8) -> JobRecord {
        JobRecord {
            id: Id([b; 32]),
            kind: 0,
            payload: vec![b],
        }
    }

    fn deps(ids: &[Id]) -> HashSet<Id> {
        ids.iter().copied().collect()
    }

    #[test]
    fn ready_jobs_run_fifo() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let mut q = JobQueue::open(test_tree(&db, "q"), |_| HashSet::new()).unwrap();

        q.push(record(3), HashSet::new()).unwrap();
        q.push(record(1), HashSet::new()).unwrap();
        q.push(record(2), HashSet::new()).unwrap();

        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([3u8; 32]));
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([1u8; 32]));
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([2u8; 32]));
        assert!(q.pop_runnable().unwrap().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn duplicate_push_rejected() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let mut q = JobQueue::open(test_tree(&db, "q"), |_| HashSet::new()).unwrap();
        assert!(q.push(record(1), HashSet::new()).unwrap());
        assert!(!q.push(record(1), HashSet::new()).unwrap());
    }

    #[test]
    fn fulfill_releases_in_id_order() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let mut q = JobQueue::open(test_tree(&db, "q"), |_| HashSet::new()).unwrap();
        let dep = Id([9u8; 32]);

        q.push(record(2), deps(&[dep])).unwrap();
        q.push(record(1), deps(&[dep])).unwrap();
        assert_eq!(q.runnable_len(), 0);
        assert_eq!(q.blocked_len(), 2);

        assert_eq!(q.fulfill(&dep).unwrap(), 2);
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([1u8; 32]));
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([2u8; 32]));
    }

    #[test]
    fn multi_dep_job_waits_for_all() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let mut q = JobQueue::open(test_tree(&db, "q"), |_| HashSet::new()).unwrap();
        let (a, b) = (Id([8u8; 32]), Id([9u8; 32]));

        q.push(record(1), deps(&[a, b])).unwrap();
        assert_eq!(q.fulfill(&a).unwrap(), 0);
        assert!(q.pop_runnable().unwrap().is_none());
        assert_eq!(q.fulfill(&b).unwrap(), 1);
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([1u8; 32]));
    }

    #[test]
    fn abandon_cascades_transitively() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let mut q = JobQueue::open(test_tree(&db, "q"), |_| HashSet::new()).unwrap();
        let never = Id([9u8; 32]);

        // 1 waits on `never`; 2 waits on 1; 3 is independent.
        q.push(record(1), deps(&[never])).unwrap();
        q.push(record(2), deps(&[Id([1u8; 32])])).unwrap();
        q.push(record(3), HashSet::new()).unwrap();

        let doomed = q.abandon(&never).unwrap();
        let ids: Vec<Id> = doomed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![Id([1u8; 32]), Id([2u8; 32])]);

        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([3u8; 32]));
        assert!(q.is_empty());
    }

    #[test]
    fn restart_restores_order_and_reresolves_deps() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let landed = Id([8u8; 32]);
        let pending = Id([9u8; 32]);
        {
            let mut q = JobQueue::open(test_tree(&db, "q"), |_| HashSet::new()).unwrap();
            q.push(record(5), HashSet::new()).unwrap();
            q.push(record(6), HashSet::new()).unwrap();
            q.push(record(1), deps(&[landed])).unwrap();
            q.push(record(2), deps(&[pending])).unwrap();
            // Crash before anything runs.
        }

        // On restart, `landed` has been decided; `pending` has not.
        let mut q = JobQueue::open(test_tree(&db, "q"), |r| {
            if r.id == Id([1u8; 32]) {
                HashSet::new()
            } else if r.id == Id([2u8; 32]) {
                deps(&[pending])
            } else {
                HashSet::new()
            }
        })
        .unwrap();

        // Persisted runnable order first, then newly-ready jobs.
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([5u8; 32]));
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([6u8; 32]));
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([1u8; 32]));
        assert!(q.pop_runnable().unwrap().is_none());
        assert_eq!(q.blocked_len(), 1);
        assert_eq!(q.fulfill(&pending).unwrap(), 1);
        assert_eq!(q.pop_runnable().unwrap().unwrap().id, Id([2u8; 32]));
    }

    #[test]
    fn popped_job_survives_at_most_once() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        {
            let mut q = JobQueue::open(test_tree(&db, "q"), |_| HashSet::new()).unwrap();
            q.push(record(1), HashSet::new()).unwrap();
            let popped = q.pop_runnable().unwrap().unwrap();
            assert_eq!(popped.id, Id([1u8; 32]));
            // Crash after pop, before/after execute: either way the record
            // is gone.
        }
        let mut q = JobQueue::open(test_tree(&db, "q"), |_| HashSet::new()).unwrap();
        assert!(q.pop_runnable().unwrap().is_none());
        assert!(q.is_empty());
    }
}
