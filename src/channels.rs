// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel policies.
//!
//! Every change row belongs to exactly one channel, and every channel carries
//! a [`ChannelPolicy`] that bounds a routing pass over it: how many rows one
//! pass may pull, how large a batch may grow, and which payload columns the
//! reader needs to fetch at all.

use serde::{Deserialize, Serialize};

/// Per-channel routing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    /// Channel identifier, matching `ChangeRow.channel_id`.
    pub channel_id: String,

    /// Position in the default channel ordering (lower routes first).
    #[serde(default)]
    pub processing_order: i32,

    /// Disabled channels are skipped entirely by a routing pass.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fetch `old_data` for rows on this channel.
    #[serde(default = "default_true")]
    pub use_old_data: bool,

    /// Fetch `row_data` for rows on this channel.
    #[serde(default = "default_true")]
    pub use_row_data: bool,

    /// Fetch `pk_data` for rows on this channel.
    #[serde(default = "default_true")]
    pub use_pk_data: bool,

    /// Soft cap on rows pulled per pass. The reader may exceed it to keep a
    /// transaction's rows together.
    #[serde(default = "default_max_data_to_route")]
    pub max_data_to_route: usize,

    /// Rows per outgoing batch before it is sealed and a new one opened.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_data_to_route() -> usize {
    100_000
}

fn default_max_batch_size() -> usize {
    10_000
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            channel_id: "default".to_string(),
            processing_order: 0,
            enabled: true,
            use_old_data: true,
            use_row_data: true,
            use_pk_data: true,
            max_data_to_route: 100_000,
            max_batch_size: 10_000,
        }
    }
}

impl ChannelPolicy {
    /// Create a policy for testing with small limits.
    pub fn for_testing(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            max_data_to_route: 1000,
            max_batch_size: 100,
            ..Default::default()
        }
    }

    /// Same policy with a different processing order.
    pub fn with_order(mut self, processing_order: i32) -> Self {
        self.processing_order = processing_order;
        self
    }
}
