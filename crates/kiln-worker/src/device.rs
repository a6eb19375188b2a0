//! Device Accountant (§4.A): tracks GPU ownership across three disjoint or
//! overlapping allocation classes and enforces the exclusivity policy
//! between vLLM-style models (monopolize a GPU) and embedding/rerank models
//! (can share one).
//!
//! Kept as a plain, synchronous struct so its placement policy is
//! unit-testable without a runtime. The one place it needs to ask "is this
//! replica vLLM-backed?" takes the answer as an injected async probe rather
//! than knowing anything about vLLM itself (§4.A rationale).

use std::collections::{HashMap, HashSet};
use std::future::Future;

use kiln_common::{ModelType, WorkerError};

#[derive(Debug, Default)]
pub struct DeviceAccountant {
    /// GPU indices this worker may allocate from, in order.
    total_gpus: Vec<u32>,
    /// Exclusive ownership: one large/non-shareable model per GPU.
    exclusive: HashMap<u32, String>,
    /// Shareable embedding/rerank occupants per GPU.
    embedding: HashMap<u32, HashSet<String>>,
    /// User-pinned occupants per GPU, tagged with the model type they were
    /// pinned as.
    pinned: HashMap<u32, HashSet<(String, ModelType)>>,
}

impl DeviceAccountant {
    pub fn new(total_gpus: Vec<u32>) -> Self {
        Self {
            total_gpus,
            exclusive: HashMap::new(),
            embedding: HashMap::new(),
            pinned: HashMap::new(),
        }
    }

    pub fn total_gpus(&self) -> &[u32] {
        &self.total_gpus
    }

    fn has_non_embedding_pin(&self, gpu: u32) -> bool {
        self.pinned
            .get(&gpu)
            .map(|set| set.iter().any(|(_, t)| !t.is_shareable()))
            .unwrap_or(false)
    }

    fn tenant_count(&self, gpu: u32) -> usize {
        let exclusive = self.exclusive.contains_key(&gpu) as usize;
        let embedding = self.embedding.get(&gpu).map(|s| s.len()).unwrap_or(0);
        let pinned = self.pinned.get(&gpu).map(|s| s.len()).unwrap_or(0);
        exclusive + embedding + pinned
    }

    /// Pick `n` GPU indices free of exclusive ownership and of any
    /// non-embedding user pin. Records them as exclusively owned by `uid`.
    pub fn allocate_exclusive(&mut self, uid: &str, n: usize) -> Result<Vec<u32>, WorkerError> {
        let mut chosen: Vec<u32> = self
            .total_gpus
            .iter()
            .copied()
            .filter(|g| !self.exclusive.contains_key(g) && !self.has_non_embedding_pin(*g))
            .take(n)
            .collect();

        if chosen.len() < n {
            return Err(WorkerError::NoSlot(format!(
                "requested {n} exclusive GPU(s) for {uid}, only {} available",
                chosen.len()
            )));
        }

        chosen.sort_unstable();
        for gpu in &chosen {
            self.exclusive.insert(*gpu, uid.to_string());
        }
        Ok(chosen)
    }

    /// Pick the GPU with the fewest current tenants among: GPUs with no
    /// exclusive owner and no pins at all, plus GPUs whose current
    /// exclusive/pinned occupants are all confirmed non-vLLM.
    pub async fn allocate_for_embedding<F, Fut>(
        &mut self,
        uid: &str,
        is_vllm_backed: F,
    ) -> Result<u32, WorkerError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut candidates = Vec::new();
        for &gpu in &self.total_gpus {
            let unoccupied = !self.exclusive.contains_key(&gpu) && !self.pinned.contains_key(&gpu);
            if unoccupied {
                candidates.push(gpu);
                continue;
            }

            let mut occupant_uids: Vec<String> = Vec::new();
            if let Some(owner) = self.exclusive.get(&gpu) {
                occupant_uids.push(owner.clone());
            }
            if let Some(pins) = self.pinned.get(&gpu) {
                occupant_uids.extend(pins.iter().map(|(u, _)| u.clone()));
            }

            let mut all_non_vllm = true;
            for occupant in &occupant_uids {
                if is_vllm_backed(occupant.clone()).await {
                    all_non_vllm = false;
                    break;
                }
            }
            if all_non_vllm {
                candidates.push(gpu);
            }
        }

        let chosen = candidates
            .into_iter()
            .min_by_key(|g| self.tenant_count(*g))
            .ok_or_else(|| WorkerError::NoSlot(format!("no GPU available for embedding model {uid}")))?;

        self.embedding.entry(chosen).or_default().insert(uid.to_string());
        Ok(chosen)
    }

    /// Pin `uid` to exactly `indices`, tagged with `model_type`. Fails if any
    /// index is outside `total_gpus`, or currently exclusively held by a
    /// vLLM-backed replica.
    pub async fn allocate_pinned<F, Fut>(
        &mut self,
        uid: &str,
        model_type: ModelType,
        indices: Vec<u32>,
        is_vllm_backed: F,
    ) -> Result<Vec<u32>, WorkerError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = bool>,
    {
        for idx in &indices {
            if !self.total_gpus.contains(idx) {
                return Err(WorkerError::InvalidArg(format!(
                    "gpu index {idx} is not in this worker's device set"
                )));
            }
        }

        for idx in &indices {
            if let Some(owner) = self.exclusive.get(idx) {
                if is_vllm_backed(owner.clone()).await {
                    return Err(WorkerError::Conflict(format!(
                        "gpu {idx} is held by vLLM-backed replica {owner}"
                    )));
                }
            }
        }

        for idx in &indices {
            if self.tenant_count(*idx) > 0 {
                tracing::warn!(gpu = idx, %uid, "pinning model onto a GPU that already has tenants");
            }
            self.pinned
                .entry(*idx)
                .or_default()
                .insert((uid.to_string(), model_type));
        }

        let mut sorted = indices;
        sorted.sort_unstable();
        Ok(sorted)
    }

    /// Remove every trace of `uid` from all three maps.
    pub fn release(&mut self, uid: &str) {
        self.exclusive.retain(|_, owner| owner != uid);
        for set in self.embedding.values_mut() {
            set.remove(uid);
        }
        self.embedding.retain(|_, set| !set.is_empty());
        for set in self.pinned.values_mut() {
            set.retain(|(owner, _)| owner != uid);
        }
        self.pinned.retain(|_, set| !set.is_empty());
    }

    pub fn gpu_to_replica(&self) -> &HashMap<u32, String> {
        &self.exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never_vllm(_uid: String) -> std::future::Ready<bool> {
        std::future::ready(false)
    }

    fn always_vllm(_uid: String) -> std::future::Ready<bool> {
        std::future::ready(true)
    }

    #[test]
    fn exclusive_allocation_is_deterministic() {
        let mut acc = DeviceAccountant::new(vec![0, 1, 2, 3]);
        let a = acc.allocate_exclusive("A", 2).unwrap();
        assert_eq!(a, vec![0, 1]);
        let b = acc.allocate_exclusive("B", 1).unwrap();
        assert_eq!(b, vec![2]);

        acc.release("A");
        let c = acc.allocate_exclusive("C", 2).unwrap();
        assert_eq!(c, vec![0, 1]);
    }

    #[test]
    fn exclusive_allocation_fails_without_enough_slots() {
        let mut acc = DeviceAccountant::new(vec![0]);
        acc.allocate_exclusive("A", 1).unwrap();
        let err = acc.allocate_exclusive("B", 1).unwrap_err();
        assert!(matches!(err, WorkerError::NoSlot(_)));
    }

    #[tokio::test]
    async fn embedding_placement_minimizes_tenant_count() {
        let mut acc = DeviceAccountant::new(vec![0, 1, 2]);
        acc.allocate_exclusive("A_llm", 1).unwrap();
        assert_eq!(acc.gpu_to_replica().get(&0), Some(&"A_llm".to_string()));
        acc.allocate_for_embedding("B_embed", never_vllm).await.unwrap();
        // B_embed should have landed on GPU 1 (empty) not GPU 0 (occupied, non-vllm-checked anyway).
        let chosen = acc.embedding.iter().find(|(_, s)| s.contains("B_embed")).map(|(g, _)| *g);
        assert_eq!(chosen, Some(1));

        let gpu_for_x = acc.allocate_for_embedding("X", never_vllm).await.unwrap();
        assert_eq!(gpu_for_x, 1);
    }

    #[tokio::test]
    async fn vllm_exclusivity_blocks_pinning() {
        let mut acc = DeviceAccountant::new(vec![0]);
        acc.allocate_exclusive("vllm-model", 1).unwrap();
        let err = acc
            .allocate_pinned("other", ModelType::Image, vec![0], always_vllm)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Conflict(_)));
    }

    #[tokio::test]
    async fn pinning_succeeds_against_non_vllm_exclusive_owner() {
        let mut acc = DeviceAccountant::new(vec![0]);
        acc.allocate_exclusive("non-vllm-model", 1).unwrap();
        let out = acc
            .allocate_pinned("other", ModelType::Image, vec![0], never_vllm)
            .await
            .unwrap();
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn release_removes_uid_from_all_maps() {
        let mut acc = DeviceAccountant::new(vec![0, 1]);
        acc.allocate_exclusive("A", 1).unwrap();
        acc.release("A");
        assert!(acc.gpu_to_replica().is_empty());
    }
}
