//! Outgoing batch assignment.
//!
//! Routed rows become entries in outgoing batches, one open batch per
//! `(node, channel)` pair at a time. A batch collects ascending `data_id`s
//! until the channel's `max_batch_size` seals it and the next row opens a
//! fresh one. Batch status changes (sent, acknowledged, failed) are signaled
//! from outside; the assigner only records them.
//!
//! The assigner also owns the channel ordering used to schedule passes:
//! channels with recent delivery errors jump the queue so their retries are
//! not starved by busy healthy channels.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::ChannelPolicy;
use crate::data::ChangeRow;

/// Outgoing batch lifecycle states, with their two-letter wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Being filled by the current pass.
    New,
    /// Being extracted for delivery.
    Querying,
    /// Handed to transport.
    Sending,
    /// Delivery or apply failed; will be retried.
    Error,
    /// Acknowledged by the target node.
    Ok,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Querying => "QY",
            BatchStatus::Sending => "SE",
            BatchStatus::Error => "ER",
            BatchStatus::Ok => "OK",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "NE" => Some(BatchStatus::New),
            "QY" => Some(BatchStatus::Querying),
            "SE" => Some(BatchStatus::Sending),
            "ER" => Some(BatchStatus::Error),
            "OK" => Some(BatchStatus::Ok),
            _ => None,
        }
    }
}

/// One batch of routed row copies bound for a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    /// Unique per target node, ascending in creation order.
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    /// When the status last changed.
    pub last_updated: DateTime<Utc>,
    /// Routed change-log ids, strictly ascending.
    pub data_ids: Vec<i64>,
    /// Approximate payload bytes across the batch.
    pub byte_count: u64,
}

impl OutgoingBatch {
    pub fn data_row_count(&self) -> usize {
        self.data_ids.len()
    }
}

/// Assigns routed rows to outgoing batches and orders channels for
/// scheduling.
#[derive(Debug, Default)]
pub struct BatchAssigner {
    batches: Vec<OutgoingBatch>,
    /// (node_id, channel_id) -> index into `batches` of the open batch.
    open: HashMap<(String, String), usize>,
    next_batch_id: i64,
}

impl BatchAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue a node's batch numbering from persisted state.
    pub fn with_starting_batch_id(next_batch_id: i64) -> Self {
        Self {
            next_batch_id,
            ..Default::default()
        }
    }

    /// Append `row`'s id to the open batch of every destination node,
    /// opening and sealing batches as the channel policy dictates.
    ///
    /// Rows must arrive in ascending `data_id` order within a pass; each
    /// batch's id list stays strictly ascending as a result.
    pub fn assign(&mut self, row: &ChangeRow, node_ids: &BTreeSet<String>, policy: &ChannelPolicy) {
        let byte_size = row.byte_size() as u64;
        for node_id in node_ids {
            let key = (node_id.clone(), row.channel_id.clone());
            let idx = match self.open.get(&key) {
                Some(&idx) => idx,
                None => {
                    let idx = self.batches.len();
                    self.next_batch_id += 1;
                    self.batches.push(OutgoingBatch {
                        batch_id: self.next_batch_id,
                        node_id: node_id.clone(),
                        channel_id: row.channel_id.clone(),
                        status: BatchStatus::New,
                        last_updated: Utc::now(),
                        data_ids: Vec::new(),
                        byte_count: 0,
                    });
                    self.open.insert(key.clone(), idx);
                    idx
                }
            };

            let batch = &mut self.batches[idx];
            batch.data_ids.push(row.data_id);
            batch.byte_count += byte_size;
            if batch.data_ids.len() >= policy.max_batch_size.max(1) {
                self.open.remove(&key); // sealed, next row opens a new batch
            }
        }
    }

    /// All batches in creation order.
    pub fn batches(&self) -> &[OutgoingBatch] {
        &self.batches
    }

    pub fn batches_for_channel(&self, channel_id: &str) -> Vec<&OutgoingBatch> {
        self.batches
            .iter()
            .filter(|b| b.channel_id == channel_id)
            .collect()
    }

    pub fn batches_for_channels(&self, channel_ids: &BTreeSet<String>) -> Vec<&OutgoingBatch> {
        self.batches
            .iter()
            .filter(|b| channel_ids.contains(&b.channel_id))
            .collect()
    }

    /// Set aside one channel's batches: remove them from the working set and
    /// return them. A channel handed to a concurrent extraction pass must not
    /// be picked up again from here.
    pub fn filter_out_channel(&mut self, channel_id: &str) -> Vec<OutgoingBatch> {
        self.remove_batches(|b| b.channel_id == channel_id)
    }

    /// Set aside several channels' batches at once.
    pub fn filter_out_channels(&mut self, channel_ids: &BTreeSet<String>) -> Vec<OutgoingBatch> {
        self.remove_batches(|b| channel_ids.contains(&b.channel_id))
    }

    /// Restrict the working set to channels in `active`, removing and
    /// returning the rest. The active set is supplied by the caller per call;
    /// the assigner holds no ambient notion of which channels are live.
    pub fn filter_to_active_channels(&mut self, active: &BTreeSet<String>) -> Vec<OutgoingBatch> {
        self.remove_batches(|b| !active.contains(&b.channel_id))
    }

    fn remove_batches(&mut self, matches: impl Fn(&OutgoingBatch) -> bool) -> Vec<OutgoingBatch> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.batches.len());
        for batch in self.batches.drain(..) {
            if matches(&batch) {
                removed.push(batch);
            } else {
                kept.push(batch);
            }
        }
        self.batches = kept;

        // Reindex the open-batch map over the survivors. A key's open batch
        // is its last batch in creation order, so inserting in order lands on
        // the right index.
        let open_keys: Vec<(String, String)> = self.open.drain().map(|(key, _)| key).collect();
        for (idx, batch) in self.batches.iter().enumerate() {
            let key = (batch.node_id.clone(), batch.channel_id.clone());
            if open_keys.contains(&key) {
                self.open.insert(key, idx);
            }
        }
        removed
    }

    /// Record a batch acknowledged by its target.
    pub fn mark_sent_ok(&mut self, batch_id: i64) -> bool {
        self.set_status(batch_id, BatchStatus::Ok)
    }

    /// Record a failed delivery or apply.
    pub fn mark_error(&mut self, batch_id: i64) -> bool {
        self.set_status(batch_id, BatchStatus::Error)
    }

    fn set_status(&mut self, batch_id: i64, status: BatchStatus) -> bool {
        match self.batches.iter_mut().find(|b| b.batch_id == batch_id) {
            Some(batch) => {
                batch.status = status;
                batch.last_updated = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Order channels for the next scheduling round.
    ///
    /// Channels carrying at least one `Error` batch come first, most recent
    /// error first, so fresh failures are retried before stale ones; equal
    /// timestamps fall back to `processing_order`. Healthy channels follow in
    /// `processing_order`. The sort is stable, so otherwise-equal channels
    /// keep their relative order. Recomputed from current batch state on
    /// every call; nothing is cached.
    pub fn sort_channels(&self, policies: &mut [ChannelPolicy]) {
        let mut last_error: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for batch in &self.batches {
            if batch.status == BatchStatus::Error {
                let entry = last_error.entry(batch.channel_id.as_str()).or_insert(batch.last_updated);
                if batch.last_updated > *entry {
                    *entry = batch.last_updated;
                }
            }
        }

        policies.sort_by(|a, b| {
            let ea = last_error.get(a.channel_id.as_str());
            let eb = last_error.get(b.channel_id.as_str());
            match (ea, eb) {
                (Some(ta), Some(tb)) => tb
                    .cmp(ta)
                    .then(a.processing_order.cmp(&b.processing_order)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.processing_order.cmp(&b.processing_order),
            }
        });
    }

    /// Consume the assigner, yielding all batches in creation order.
    pub fn into_batches(self) -> Vec<OutgoingBatch> {
        self.batches
    }
}
