//! # Merger — background tier compaction
//!
//! A single worker thread consumes batches of tier-0 segments from the
//! manager's merge channel. Each batch runs a merge cycle that may cascade:
//! merging tier N fills tier N+1, which may itself reach the threshold and
//! merge further down, until `MAX_LEVEL`.
//!
//! The source segments stay listed in the manifest until the merged
//! replacement has been committed by an atomic manifest rewrite; only after
//! the whole cycle returns are their files unlinked. A crash at any point
//! therefore leaves either the old layout or the new one — never neither —
//! and at worst an orphaned output file for startup cleanup.

use anyhow::{ensure, Context, Result};
use crossbeam_channel::Receiver;
use memtable::MemTable;
use sstable::SsTableWriter;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::manager::{LsmManager, Segment, Tier};
use crate::{MAX_LEVEL, MERGE_THRESHOLD, TOMBSTONE};

/// Worker loop: run one merge cycle per queued batch, then unlink the
/// merged-away files. Ends when the manager drops the sender.
pub(crate) fn run(manager: Arc<LsmManager>, rx: Receiver<Vec<Arc<Segment>>>) {
    for batch in rx.iter() {
        let mut to_delete = Vec::new();
        if let Err(e) = run_merge_cycle(&manager, 0, batch, &mut to_delete) {
            // The failed batch is lost; its source segments remain live and
            // a later flush will queue them again.
            error!(error = %e, "merge cycle failed");
        }

        for seg in to_delete {
            let path = seg.table.path().to_path_buf();
            drop(seg);
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "failed to unlink merged segment");
            }
        }
    }
}

/// Merges `segments` out of tier `level` into `min(level+1, MAX_LEVEL)`,
/// commits the new layout, and cascades while the target tier keeps hitting
/// the threshold.
fn run_merge_cycle(
    manager: &Arc<LsmManager>,
    level: usize,
    segments: Vec<Arc<Segment>>,
    to_delete: &mut Vec<Arc<Segment>>,
) -> Result<()> {
    let target = (level + 1).min(MAX_LEVEL);

    let merged = perform_merge(manager, target, &segments)
        .with_context(|| format!("merge io failed for tier {}", level))?;

    let next_batch = {
        let mut state = manager.write_state();

        while state.tiers.len() <= target {
            let next_level = state.tiers.len();
            state.tiers.push(Tier {
                level: next_level,
                segments: Vec::new(),
            });
        }

        // Keep enough around to revert if the manifest rewrite fails: the
        // in-memory tiers must never disagree with the manifest on disk.
        let source_before = state.tiers[level].segments.clone();
        let target_before = state.tiers[target].segments.clone();

        let merged_ids: HashSet<u64> = segments.iter().map(|s| s.id).collect();
        state.tiers[level]
            .segments
            .retain(|s| !merged_ids.contains(&s.id));
        if let Some(seg) = &merged {
            state.tiers[target].segments.push(Arc::clone(seg));
        }

        if let Err(e) = state.to_manifest().write(manager.data_dir()) {
            state.tiers[level].segments = source_before;
            state.tiers[target].segments = target_before;
            return Err(e.context(format!("failed to commit merge for tier {}", level)));
        }

        if target < MAX_LEVEL && state.tiers[target].segments.len() >= MERGE_THRESHOLD {
            Some(state.tiers[target].segments.clone())
        } else {
            None
        }
    };

    // Committed: the inputs can be unlinked once the whole cycle is done.
    to_delete.extend(segments);

    if let Some(batch) = next_batch {
        return run_merge_cycle(manager, target, batch, to_delete);
    }
    Ok(())
}

/// Builds the merged segment for `target`: resolve duplicates through a
/// transient memtable (batch order is oldest-first, so younger records
/// overwrite older ones), then write the survivors.
///
/// Tombstones shield deleted keys from resurrection by deeper tiers, so
/// they are carried through every merge except one that produces a segment
/// at `MAX_LEVEL` — below that there is nothing left to shield.
///
/// Returns `None` when nothing survives (every key tombstoned at the
/// bottom): the inputs are simply dropped without a replacement.
fn perform_merge(
    manager: &Arc<LsmManager>,
    target: usize,
    segments: &[Arc<Segment>],
) -> Result<Option<Arc<Segment>>> {
    ensure!(!segments.is_empty(), "cannot merge zero segments");

    let scratch = MemTable::unlogged();
    for seg in segments {
        let records = seg
            .table
            .read_all_records()
            .with_context(|| format!("could not read records from segment {}", seg.id))?;
        for (key, value) in records {
            scratch.insert(&key, &value)?;
        }
    }

    let drop_tombstones = target == MAX_LEVEL;
    let live: Vec<(Vec<u8>, Vec<u8>)> = scratch
        .entries()
        .into_iter()
        .filter(|(_, v)| !drop_tombstones || v.as_slice() != TOMBSTONE)
        .collect();

    if live.is_empty() {
        debug!(target_tier = target, "merge produced no surviving records");
        return Ok(None);
    }

    let path = manager.create_sstable_path();
    let mut writer = SsTableWriter::create(&path, live.len())?;
    for (key, value) in &live {
        writer.append(key, value)?;
    }
    writer
        .finalize()
        .with_context(|| format!("could not finalize merged segment {}", path.display()))?;

    let seg = Segment::open(&path)
        .with_context(|| format!("could not load merged segment {}", path.display()))?;
    debug!(
        target_tier = target,
        segment = %path.display(),
        records = live.len(),
        "merge produced new segment"
    );
    Ok(Some(Arc::new(seg)))
}
