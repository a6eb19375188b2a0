//! Recovery Controller (§4.F).
//!
//! Wired as the Sub-Pool Broker's death notifications (§4.B, §9 design
//! note: "the callback must hop onto the main loop rather than mutate
//! state from the pool's own context"). This module is the consumer side
//! of that channel: it drains [`SubPoolDied`] events on a task spawned
//! from the Worker's own construction and re-enters the Launch Controller
//! to replay bounded re-launches with the exact original arguments.

use tokio::sync::mpsc;

use kiln_common::origin_uid;

use crate::launch::{self, LaunchOutcome, WorkerCtx};
use crate::outbound::EventType;
use crate::subpool::SubPoolDied;

/// Drains sub-pool death notifications for the lifetime of the Worker.
/// Spawned once at startup; exits only when the channel closes (Worker
/// shutdown).
pub async fn recovery_loop(ctx: std::sync::Arc<WorkerCtx>, mut deaths: mpsc::UnboundedReceiver<SubPoolDied>) {
    while let Some(died) = deaths.recv().await {
        handle_sub_pool_death(&ctx, &died.address).await;
    }
    tracing::info!("recovery loop exiting: death channel closed");
}

/// §4.F steps 1-4: an unexpected sub-pool death terminates the owning
/// replica, then (bounded by `recovery_remaining`) re-launches it from its
/// stored `LaunchArgs`, unchanged.
async fn handle_sub_pool_death(ctx: &WorkerCtx, address: &str) {
    let _ = ctx.subpool.remove_sub_pool(address, true).await;

    let uid = {
        let state = ctx.state.lock().await;
        state.find_uid_by_sub_pool_address(address)
    };

    let Some(uid) = uid else {
        tracing::info!(%address, "sub-pool died with no matching model table entry, replica likely died mid-launch");
        return;
    };

    let (launch_args, recovery_remaining) = {
        let state = ctx.state.lock().await;
        match state.model_table.get(&uid) {
            Some(entry) => (Some(entry.launch_args.clone()), entry.recovery_remaining),
            None => (None, None),
        }
    };

    let Some(launch_args) = launch_args else {
        tracing::info!(%uid, %address, "no stored launch args for dead sub-pool, not recovering");
        return;
    };

    let _ = launch::terminate_model(ctx, &uid, true).await;

    let origin = origin_uid(&uid);
    ctx.supervisor
        .report_event(&origin, EventType::Warning, "Recreate model".to_string())
        .await;

    let next_remaining = match recovery_remaining {
        None => None,
        Some(0) => {
            tracing::warn!(%uid, "recovery counter exhausted, stop recreating");
            return;
        }
        Some(n) => Some(n - 1),
    };

    let xavier_rank = launch_args.xavier_config.as_ref().and_then(|x| x.rank);
    if let Some(rank) = xavier_rank {
        if let Err(e) = ctx.supervisor.unregister_rank(&origin, rank).await {
            tracing::warn!(%uid, error = %e, "failed to unregister collective rank before recovery");
        }
    }

    ctx.metrics.record_recovery();
    match launch::launch_builtin_model(ctx, launch_args).await {
        Ok(outcome) => {
            if let Some(rank) = xavier_rank {
                let new_address = match &outcome {
                    LaunchOutcome::Address(a) => a.clone(),
                    LaunchOutcome::WithDriverInfo(a, _) => a.clone(),
                };
                if let Err(e) = ctx.transport.start_transfer_for_vllm(&new_address, Vec::new()).await {
                    tracing::warn!(%uid, error = %e, "start_transfer_for_vllm failed after recovery");
                }
                if let Err(e) = ctx.supervisor.register_rank(&origin, rank, &new_address).await {
                    tracing::warn!(%uid, error = %e, "failed to re-register collective rank after recovery");
                }
            }
            if let Some(n) = next_remaining {
                let mut state = ctx.state.lock().await;
                if let Some(entry) = state.model_table.get_mut(&uid) {
                    entry.recovery_remaining = Some(n);
                }
            }
        }
        Err(e) => {
            tracing::error!(%uid, error = %e, "recovery re-launch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{test_ctx, test_launch_args};
    use crate::model_table::ModelTableEntry;

    async fn seed_committed_replica(ctx: &WorkerCtx, uid: &str, recovery_remaining: Option<u32>) -> String {
        let address = ctx.subpool.create_sub_pool(Default::default(), None).await.unwrap();
        let mut state = ctx.state.lock().await;
        state.model_table.insert(
            uid.to_string(),
            ModelTableEntry {
                description: kiln_common::ModelDescription::default(),
                last_error: None,
                sub_pool_address: address.clone(),
                extra_sub_pool_addresses: Vec::new(),
                recovery_remaining,
                launch_args: test_launch_args(uid),
            },
        );
        address
    }

    #[tokio::test]
    async fn death_of_unknown_address_is_a_no_op() {
        let ctx = test_ctx();
        handle_sub_pool_death(&ctx, "no-such-address").await;
    }

    #[tokio::test]
    async fn unlimited_recovery_relaunches_the_replica() {
        let ctx = test_ctx();
        let address = seed_committed_replica(&ctx, "recoverable-0", None).await;

        handle_sub_pool_death(&ctx, &address).await;

        let state = ctx.state.lock().await;
        let entry = state.model_table.get("recoverable-0").expect("relaunched replica is present again");
        assert_eq!(entry.recovery_remaining, None);
    }

    #[tokio::test]
    async fn exhausted_recovery_counter_stops_recreating() {
        let ctx = test_ctx();
        let address = seed_committed_replica(&ctx, "exhausted-0", Some(0)).await;

        handle_sub_pool_death(&ctx, &address).await;

        let state = ctx.state.lock().await;
        assert!(state.is_free("exhausted-0"));
    }

    #[tokio::test]
    async fn bounded_recovery_decrements_the_counter() {
        let ctx = test_ctx();
        let address = seed_committed_replica(&ctx, "bounded-0", Some(3)).await;

        handle_sub_pool_death(&ctx, &address).await;

        let state = ctx.state.lock().await;
        let entry = state.model_table.get("bounded-0").expect("relaunched replica is present again");
        assert_eq!(entry.recovery_remaining, Some(2));
    }
}
