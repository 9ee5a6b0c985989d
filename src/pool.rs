//! Pool readiness
//!
//! Brings the worker pool to a usable state: create it if absent (picking a
//! machine image from the provider's catalog), resize it if it already
//! exists, then wait first for steady allocation and then for at least one
//! idle node. Readiness means one schedulable node, not a full pool; tasks
//! can start while remaining nodes boot.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ImageSelector, RunConfig};
use crate::poll::poll_until;
use crate::provider::{
    AllocationState, ComputePool, ImageInfo, ImageVerification, NodeState, OsType,
    PoolCreateSpec, PoolLifecycleState, PoolStatus,
};
use crate::{Error, Result};

/// Pick the image to boot workers from.
///
/// First catalog entry that is Linux, verified against the worker agent, and
/// matches the selector's publisher and offer case-insensitively. No match
/// is a configuration error, reported before any pool is created.
pub fn select_image(catalog: &[ImageInfo], selector: &ImageSelector) -> Result<ImageInfo> {
    catalog
        .iter()
        .find(|img| {
            img.os_type == OsType::Linux
                && img.verification == ImageVerification::Verified
                && img.reference.publisher.eq_ignore_ascii_case(&selector.publisher)
                && img.reference.offer.eq_ignore_ascii_case(&selector.offer)
        })
        .cloned()
        .ok_or_else(|| {
            Error::config(format!(
                "no verified Linux image matches publisher '{}' offer '{}'",
                selector.publisher, selector.offer
            ))
        })
}

/// Ensure the pool exists, is steadily allocated, and has an idle node.
///
/// Idempotent with respect to the pool id: an existing active pool is
/// resized to the configured node count rather than recreated, so runs can
/// share a warm pool. A pool that exists but is no longer active (mid
/// deletion) is treated as absent and a fresh create is issued; if the old
/// pool is still in the way the provider's duplicate-create error surfaces
/// as-is. Returns the pool's status as observed after the waits.
pub async fn ensure_ready(
    compute: &dyn ComputePool,
    config: &RunConfig,
    cancel: &CancellationToken,
) -> Result<PoolStatus> {
    let pool_id = &config.pool_id;

    let reusable = if compute.pool_exists(pool_id).await? {
        let status = compute.get_pool(pool_id).await?;
        status.lifecycle_state == PoolLifecycleState::Active
    } else {
        false
    };

    if reusable {
        info!(pool = %pool_id, nodes = config.target_node_count, "pool exists, resizing");
        compute
            .resize_pool(pool_id, config.target_node_count)
            .await?;
    } else {
        let catalog = compute.list_supported_images().await?;
        let image = select_image(&catalog, &config.image)?;
        info!(
            pool = %pool_id,
            publisher = %image.reference.publisher,
            offer = %image.reference.offer,
            sku = %image.reference.sku,
            "creating pool"
        );
        compute
            .create_pool(&PoolCreateSpec {
                id: pool_id.clone(),
                vm_size: config.vm_size.clone(),
                image: image.reference.clone(),
                node_agent_sku_id: image.node_agent_sku_id.clone(),
                target_dedicated_nodes: config.target_node_count,
            })
            .await?;
    }

    poll_until(
        config.timeouts.poll_interval,
        config.timeouts.pool_steady,
        "pool steady allocation",
        cancel,
        || async move {
            let status = compute.get_pool(pool_id).await?;
            Ok((status.allocation_state == AllocationState::Steady).then_some(()))
        },
    )
    .await?;

    poll_until(
        config.timeouts.poll_interval,
        config.timeouts.node_ready,
        "an idle node",
        cancel,
        || async move {
            let idle = compute.list_nodes(pool_id, Some(NodeState::Idle)).await?;
            Ok((!idle.is_empty()).then_some(()))
        },
    )
    .await?;

    let status = compute.get_pool(pool_id).await?;
    info!(pool = %pool_id, nodes = status.target_dedicated_nodes, "pool ready");
    Ok(status)
}
