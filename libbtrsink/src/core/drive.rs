use super::{
    estimate::{annotate_edges, EstimateMode},
    humanize,
    plan::{self, Plan, PlanRequest},
    DiffSink, Store, SyncError, TransferProgress,
};
use crate::model::{Diff, IdentityIndex, Volume};
use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

const TRANSFER_ATTEMPTS: u32 = 3;

pub struct SyncOptions {
    pub dry_run: bool,
    pub delete: bool,
    pub estimate: EstimateMode,
    pub excludes: Vec<Regex>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            delete: false,
            estimate: EstimateMode::Measure,
            excludes: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub transferred: u64,
    pub transferred_bytes: u64,
    pub deleted: u64,
    pub unreachable: Vec<Uuid>,
}

/// Drive the synchronization loop: plan, execute the first ready diff,
/// re-enumerate and re-plan, until the plan comes back empty. Re-planning
/// after every transfer keeps the invariant that a diff's parent is durably
/// resident on the destination before the child's transfer begins, and lets
/// a freshly landed volume serve as a parent in the very next round.
pub async fn sync_stores(source: &mut dyn Store, dest: &mut dyn Store, options: &SyncOptions) -> Result<SyncOutcome> {
    let mut outcome = SyncOutcome::default();
    let mut simulated: Vec<Volume> = Vec::new();
    let mut last_pending: Option<usize> = None;
    let mut round = 0u32;

    loop {
        round += 1;
        slog_scope::debug!("planning round {}", round);

        if options.estimate.uses_quota() {
            source.rescan_sizes().await?;
        }

        let source_volumes_raw = source.list_volumes().await?;
        let source_volumes = filter_excluded(source, source_volumes_raw, &options.excludes).await?;
        let mut dest_volumes = dest.list_volumes().await?;
        dest_volumes.extend(simulated.iter().cloned());

        let mut edges = Vec::new();
        for volume in source_volumes.iter().chain(dest_volumes.iter()) {
            edges.extend(source.edges(volume).await?);
            edges.extend(dest.edges(volume).await?);
        }
        let edges = annotate_edges(edges, options.estimate, source, dest).await;

        let plan = plan::solve(&PlanRequest {
            source_volumes: &source_volumes,
            dest_volumes: &dest_volumes,
            dest_name: dest.name(),
            edges: &edges,
        });

        if round == 1 {
            log_summary(&plan);
        }
        outcome.unreachable = plan.unreachable.clone();

        let pending = plan.pending().count();
        if let Some(previous) = last_pending {
            if pending >= previous {
                bail!(SyncError::TransferFatal(String::from(
                    "a completed transfer did not shrink the plan"
                )));
            }
        }

        if plan.is_synchronized() {
            if !plan.unreachable.is_empty() {
                slog_scope::error!("{} source volume(s) cannot be replicated", plan.unreachable.len());
            } else if options.delete {
                if options.dry_run {
                    slog_scope::info!("skipping deletions in dry run");
                } else {
                    outcome.deleted = prune_destination(dest, &plan, &source_volumes).await?;
                }
            }
            break;
        }

        let node = match plan.next_ready() {
            Some(node) => node.clone(),
            None => bail!(SyncError::TransferFatal(String::from(
                "volumes remain but no diff has a resident parent"
            ))),
        };
        last_pending = Some(pending);

        let identity = IdentityIndex::build(source_volumes.iter().chain(dest_volumes.iter()));
        let volume = source_volumes
            .iter()
            .find(|v| identity.resolve(v.uuid) == node.uuid)
            .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(node.uuid)))?
            .clone();
        let diff = Diff {
            to_uuid: node.uuid,
            from_uuid: node.previous,
            sink: node.diff_sink.clone(),
            size: node.size,
            exact: node.exact,
        };

        if options.dry_run {
            slog_scope::info!("would transfer {} ({})", diff, humanize(diff.size));
            simulated.push(volume);
            outcome.transferred += 1;
            outcome.transferred_bytes += diff.size;
            continue;
        }

        let bytes = transfer_with_retry(source, dest, &diff, &volume).await?;
        outcome.transferred += 1;
        outcome.transferred_bytes += bytes;
    }

    Ok(outcome)
}

async fn filter_excluded(
    store: &mut dyn Store,
    volumes: Vec<Volume>,
    excludes: &[Regex],
) -> Result<Vec<Volume>> {
    if excludes.is_empty() {
        return Ok(volumes);
    }
    let mut kept = Vec::with_capacity(volumes.len());
    for volume in volumes {
        let paths = store.paths(&volume).await?;
        if paths.iter().any(|p| excludes.iter().any(|rx| rx.is_match(p))) {
            slog_scope::debug!("excluding {}", volume);
        } else {
            kept.push(volume);
        }
    }
    Ok(kept)
}

fn log_summary(plan: &Plan) {
    let summary = plan.summary();
    slog_scope::info!("optimal synchronization:");
    for (sink, totals) in &summary.sinks {
        slog_scope::info!("{} from {} diffs in {}", humanize(totals.size), totals.count, sink);
    }
    slog_scope::info!(
        "{} from {} diffs in TOTAL",
        humanize(summary.total.size),
        summary.total.count
    );
}

async fn transfer_with_retry(
    source: &mut dyn Store,
    dest: &mut dyn Store,
    diff: &Diff,
    volume: &Volume,
) -> Result<u64> {
    let mut attempt = 1u32;
    loop {
        match execute_transfer(source, dest, diff, volume).await {
            Ok(bytes) => return Ok(bytes),
            Err(error) if SyncError::is_transient(&error) && attempt < TRANSFER_ATTEMPTS => {
                let backoff = Duration::from_secs(1 << attempt);
                slog_scope::warn!(
                    "transfer of {} failed on attempt {} of {}, retrying in {:?}: {:#}",
                    diff,
                    attempt,
                    TRANSFER_ATTEMPTS,
                    backoff,
                    error
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(error) => return Err(error).context(format!("transfer of {} failed", diff)),
        }
    }
}

async fn execute_transfer(
    source: &mut dyn Store,
    dest: &mut dyn Store,
    diff: &Diff,
    volume: &Volume,
) -> Result<u64> {
    slog_scope::info!("transferring {} ({})", diff, humanize(diff.size));
    let mut sink = dest.receive_diff(diff, volume).await?;
    let mut progress = TransferProgress::new();

    let result = {
        let send = source.send_diff(diff, sink.as_mut(), &mut progress);
        tokio::pin!(send);
        tokio::select! {
            result = &mut send => result,
            _ = tokio::signal::ctrl_c() => Err(anyhow!(SyncError::TransferFatal(String::from("interrupted")))),
        }
    };

    match result {
        Ok(()) => {
            let materialized = sink.finish().await?;
            slog_scope::info!("received {} ({})", materialized, progress.describe());
            Ok(progress.bytes())
        }
        Err(error) => {
            if let Err(abort_error) = sink.abort().await {
                slog_scope::warn!("failed to abort partial receive: {:#}", abort_error);
            }
            Err(error)
        }
    }
}

/// End-of-run pruning: remove destination volumes absent from the source,
/// keeping any the plan still relies on as diff parents. Children go before
/// parents. Individual failures are reported but do not fail the run.
async fn prune_destination(dest: &mut dyn Store, plan: &Plan, source_volumes: &[Volume]) -> Result<u64> {
    let dest_volumes = dest.list_volumes().await?;
    let identity = IdentityIndex::build(source_volumes.iter().chain(dest_volumes.iter()));
    let source_set: HashSet<Uuid> = source_volumes.iter().map(|v| identity.resolve(v.uuid)).collect();
    let required = plan.required_ancestors();

    let mut candidates: Vec<&Volume> = dest_volumes
        .iter()
        .filter(|v| {
            let canon = identity.resolve(v.uuid);
            !source_set.contains(&canon) && !required.contains(&canon)
        })
        .collect();
    candidates.sort_by_key(|v| std::cmp::Reverse((v.otime, v.uuid)));

    let mut deleted = 0;
    for volume in candidates {
        slog_scope::info!("deleting {}", volume);
        match dest.delete_volume(volume.uuid).await {
            Ok(()) => deleted += 1,
            Err(error) => slog_scope::warn!("failed to delete {}: {:#}", volume, error),
        }
    }
    Ok(deleted)
}
