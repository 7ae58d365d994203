//! Per-partition health: HEALTHY until a transport or ack error marks it
//! DEAD; DEAD until the cooldown elapses and a probe succeeds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::PartitionId;
use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Health {
    Healthy,
    Dead { since: Instant },
}

pub struct PartitionTable {
    cooldown: Duration,
    entries: Mutex<HashMap<PartitionId, Health>>,
}

impl PartitionTable {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_alive(&self, partition: &PartitionId) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        !matches!(entries.get(partition), Some(Health::Dead { .. }))
    }

    pub fn mark_dead(&self, partition: &PartitionId) {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        let was_alive = !matches!(entries.get(partition), Some(Health::Dead { .. }));
        entries.insert(
            partition.clone(),
            Health::Dead {
                since: Instant::now(),
            },
        );
        if was_alive {
            tracing::warn!(%partition, "partition marked dead");
            metrics::counter(
                "partitions_marked_dead",
                1,
                vec![("partition", partition.to_string())],
            );
        }
    }

    pub fn revive(&self, partition: &PartitionId) {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        if entries.insert(partition.clone(), Health::Healthy)
            != Some(Health::Healthy)
        {
            tracing::info!(%partition, "partition healthy again");
        }
    }

    /// Dead partitions whose cooldown has elapsed, ready for a probe.
    pub fn due_for_probe(&self) -> Vec<PartitionId> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries
            .iter()
            .filter_map(|(partition, health)| match health {
                Health::Dead { since } if since.elapsed() >= self.cooldown => {
                    Some(partition.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn dead_len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries
            .values()
            .filter(|health| matches!(health, Health::Dead { .. }))
            .count()
    }
}
