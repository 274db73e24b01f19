//! Packing of completed tasks into the execute body.
//!
//! Completed tasks are embedded in the request so the endpoint can skip
//! re-executing them. The embedded set is a deterministic prefix bounded by
//! a serialised byte budget; endpoints that understand the cursor can page
//! through the remainder. No-op tasks are additionally summarised in a
//! Bloom filter, which the endpoint treats as "probably a cached no-op" —
//! false positives are acceptable, false negatives are not.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{Task, TaskStatus};
use crate::{NOOP_TASK_SET_SIZE, TOTAL_CACHED_TASK_BYTE_LIMIT};

/// Projection of a completed task as embedded in the execute body. The `id`
/// the endpoint resolves cached tasks by is the idempotency key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTask {
    pub id: String,
    pub status: TaskStatus,
    pub noop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl CachedTask {
    fn from_task(task: &Task) -> Self {
        CachedTask {
            id: task.idempotency_key.clone(),
            status: task.status,
            noop: task.noop,
            output: if task.output_is_undefined {
                None
            } else {
                task.output.clone()
            },
            parent_id: task.parent_id.map(|id| id.to_string()),
        }
    }

    fn serialized_len(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct PreparedTasks {
    pub tasks: Vec<CachedTask>,
    /// Idempotency key of the first task that did not fit; the endpoint can
    /// request the next page with it.
    pub cursor: Option<String>,
}

/// Select the longest prefix of `tasks` whose serialised size stays within
/// `byte_limit`. Input order is preserved, so the prefix is deterministic
/// for a given aggregate load.
pub fn prepare_tasks(tasks: &[Task], byte_limit: usize) -> PreparedTasks {
    let mut selected = Vec::with_capacity(tasks.len());
    let mut used = 0usize;
    for (index, task) in tasks.iter().enumerate() {
        let cached = CachedTask::from_task(task);
        let size = cached.serialized_len();
        if used + size > byte_limit {
            return PreparedTasks {
                tasks: selected,
                cursor: Some(tasks[index].idempotency_key.clone()),
            };
        }
        used += size;
        selected.push(cached);
    }
    PreparedTasks {
        tasks: selected,
        cursor: None,
    }
}

/// Legacy packing for endpoints that predate the cursor: same prefix rule,
/// remainder silently dropped.
pub fn prepare_tasks_legacy(tasks: &[Task]) -> Vec<CachedTask> {
    prepare_tasks(tasks, TOTAL_CACHED_TASK_BYTE_LIMIT).tasks
}

/// Build the serialised Bloom filter of no-op idempotency keys.
pub fn prepare_noop_tasks_bloom(tasks: &[Task]) -> String {
    let mut filter = BloomFilter::with_capacity(NOOP_TASK_SET_SIZE);
    for task in tasks {
        if task.status == TaskStatus::Completed && task.noop {
            filter.insert(&task.idempotency_key);
        }
    }
    filter.serialize()
}

const BITS_PER_KEY: usize = 10;
const HASH_COUNT: u32 = 7;

/// Fixed-size Bloom filter over string keys, hashed with SHA-256 so the bit
/// pattern is stable across processes.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    bit_count: u64,
}

impl BloomFilter {
    pub fn with_capacity(capacity: usize) -> Self {
        let bit_count = (capacity.max(1) * BITS_PER_KEY) as u64;
        let byte_count = bit_count.div_ceil(8) as usize;
        Self {
            bits: vec![0u8; byte_count],
            bit_count,
        }
    }

    fn bit_index(&self, key: &str, round: u32) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(round.to_be_bytes());
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix) % self.bit_count
    }

    pub fn insert(&mut self, key: &str) {
        for round in 0..HASH_COUNT {
            let index = self.bit_index(key, round);
            self.bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        (0..HASH_COUNT).all(|round| {
            let index = self.bit_index(key, round);
            self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
        })
    }

    /// One-line textual form: bit count, hash rounds, then the bit array.
    pub fn serialize(&self) -> String {
        format!(
            "{}:{}:{}",
            self.bit_count,
            HASH_COUNT,
            BASE64.encode(&self.bits)
        )
    }

    pub fn deserialize(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let bit_count: u64 = parts.next()?.parse().ok()?;
        let hash_count: u32 = parts.next()?.parse().ok()?;
        if hash_count != HASH_COUNT {
            return None;
        }
        let bits = BASE64.decode(parts.next()?).ok()?;
        if (bits.len() as u64) < bit_count.div_ceil(8) {
            return None;
        }
        Some(Self { bits, bit_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunId, TaskId};
    use chrono::Utc;
    use proptest::prelude::*;

    fn completed_task(key: &str, noop: bool, output: Option<Value>) -> Task {
        Task {
            id: TaskId::new(),
            run_id: RunId::new(),
            idempotency_key: key.to_string(),
            display_key: None,
            status: TaskStatus::Completed,
            noop,
            output,
            output_is_undefined: false,
            output_properties: None,
            parent_id: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn packs_everything_under_a_generous_limit() {
        let tasks = vec![
            completed_task("a", false, Some(serde_json::json!({"n": 1}))),
            completed_task("b", true, None),
        ];
        let prepared = prepare_tasks(&tasks, TOTAL_CACHED_TASK_BYTE_LIMIT);
        assert_eq!(prepared.tasks.len(), 2);
        assert_eq!(prepared.cursor, None);
    }

    #[test]
    fn stops_at_the_byte_limit_and_reports_a_cursor() {
        let big = "x".repeat(200);
        let tasks = vec![
            completed_task("first", false, Some(serde_json::json!(big.clone()))),
            completed_task("second", false, Some(serde_json::json!(big))),
        ];
        let one_task_size = CachedTask::from_task(&tasks[0]).serialized_len();
        let prepared = prepare_tasks(&tasks, one_task_size);
        assert_eq!(prepared.tasks.len(), 1);
        assert_eq!(prepared.cursor.as_deref(), Some("second"));
    }

    #[test]
    fn undefined_output_is_dropped_from_the_projection() {
        let mut task = completed_task("a", false, Some(serde_json::json!(1)));
        task.output_is_undefined = true;
        let prepared = prepare_tasks(&[task], TOTAL_CACHED_TASK_BYTE_LIMIT);
        assert!(prepared.tasks[0].output.is_none());
    }

    #[test]
    fn bloom_contains_every_noop_key() {
        let mut tasks = Vec::new();
        for i in 0..NOOP_TASK_SET_SIZE {
            tasks.push(completed_task(&format!("noop-{i}"), true, None));
        }
        tasks.push(completed_task("not-a-noop", false, None));

        let raw = prepare_noop_tasks_bloom(&tasks);
        let filter = BloomFilter::deserialize(&raw).expect("round trip");
        for i in 0..NOOP_TASK_SET_SIZE {
            assert!(filter.contains(&format!("noop-{i}")));
        }
    }

    #[test]
    fn non_completed_noops_are_excluded() {
        let mut waiting = completed_task("waiting-noop", true, None);
        waiting.status = TaskStatus::Waiting;
        let raw = prepare_noop_tasks_bloom(&[waiting]);
        let filter = BloomFilter::deserialize(&raw).expect("round trip");
        // An empty filter cannot contain anything.
        assert!(!filter.contains("waiting-noop"));
    }

    proptest! {
        #[test]
        fn bloom_never_reports_false_negatives(keys in proptest::collection::vec("[a-z0-9]{1,32}", 1..200)) {
            let mut filter = BloomFilter::with_capacity(NOOP_TASK_SET_SIZE);
            for key in &keys {
                filter.insert(key);
            }
            for key in &keys {
                prop_assert!(filter.contains(key));
            }
        }

        #[test]
        fn packed_size_respects_the_budget(count in 1usize..50, payload in "[a-z]{0,64}") {
            let tasks: Vec<Task> = (0..count)
                .map(|i| completed_task(&format!("task-{i}"), false, Some(serde_json::json!(payload.clone()))))
                .collect();
            let limit = 1_000usize;
            let prepared = prepare_tasks(&tasks, limit);
            let total: usize = prepared.tasks.iter().map(|t| t.serialized_len()).sum();
            prop_assert!(total <= limit);
        }
    }
}
