//! The Model Table and Launching Guard (§3 Data Model), plus the Device
//! Accountant, all behind a single mutex so that Launch, Terminate, and the
//! Recovery Controller observe one consistent view (§5 "Ordering
//! guarantees").
//!
//! Invariant 1 ("a replica UID appears in exactly one of: Launching Guard,
//! Model Table, or neither") is enforced structurally here: both are plain
//! `HashMap`s keyed by replica UID and every call site that inserts into one
//! removes from the other first.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use kiln_common::{LaunchArgs, ModelDescription};

use crate::device::DeviceAccountant;
use crate::downloader::DownloaderHandle;
use crate::venv::VenvManagerHandle;

/// A committed replica: present in the Model Table.
#[derive(Debug, Clone)]
pub struct ModelTableEntry {
    pub description: ModelDescription,
    pub last_error: Option<String>,
    pub sub_pool_address: String,
    pub extra_sub_pool_addresses: Vec<String>,
    /// `None` means unlimited recovery attempts.
    pub recovery_remaining: Option<u32>,
    /// Verbatim snapshot replayed on recovery (§3 invariant 5).
    pub launch_args: LaunchArgs,
}

/// A launch in flight: present in the Launching Guard.
pub struct LaunchingGuardEntry {
    pub cancel: CancellationToken,
    pub downloader: Option<DownloaderHandle>,
    pub virtualenv_manager: Option<VenvManagerHandle>,
    pub sub_pools: Vec<String>,
}

impl LaunchingGuardEntry {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            downloader: None,
            virtualenv_manager: None,
            sub_pools: Vec::new(),
        }
    }
}

impl Default for LaunchingGuardEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// The Worker's entire mutable state, guarded by one lock.
pub struct WorkerState {
    pub model_table: HashMap<String, ModelTableEntry>,
    pub launching_guard: HashMap<String, LaunchingGuardEntry>,
    pub devices: DeviceAccountant,
}

impl WorkerState {
    pub fn new(total_gpus: Vec<u32>) -> Self {
        Self {
            model_table: HashMap::new(),
            launching_guard: HashMap::new(),
            devices: DeviceAccountant::new(total_gpus),
        }
    }

    /// Invariant 1: a UID may not already be present in either map.
    pub fn is_free(&self, uid: &str) -> bool {
        !self.model_table.contains_key(uid) && !self.launching_guard.contains_key(uid)
    }

    /// Find the replica UID whose Model Table entry owns `sub_pool_address`
    /// (§4.F Recovery Controller step 2 — linear scan, a worker holds few
    /// models).
    pub fn find_uid_by_sub_pool_address(&self, address: &str) -> Option<String> {
        self.model_table
            .iter()
            .find(|(_, entry)| {
                entry.sub_pool_address == address || entry.extra_sub_pool_addresses.iter().any(|a| a == address)
            })
            .map(|(uid, _)| uid.clone())
    }
}

pub type SharedWorkerState = Arc<Mutex<WorkerState>>;
