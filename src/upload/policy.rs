//! The Buffer Upload Policy: per-buffer batching mode sitting in front of
//! the Upload Recorder.
//!
//! Ported field-for-field from `BufferUploadPolicyState` in
//! `include/Render/Runtime/BufferUploadPolicy.h`: `SetPolicy`,
//! `OnBufferResized`, `BeginFrame` (a documented no-op — writes may be
//! staged before the first frame begins), `StageWrite`,
//! `FlushToUploadService`, `AddOrMergeDirtyRange`, `CoalesceDirtyRanges`.

use crate::error::{Result, UploadStatsError};
use crate::upload::recorder::UploadRecorder;
use crate::upload::target::UploadTarget;
use crate::upload::update::Provenance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadPolicyTag {
    #[default]
    Immediate,
    Coalesced,
    CoalescedRetained,
}

#[derive(Debug, Clone, Copy)]
struct DirtyRange {
    begin: u64,
    end: u64,
    provenance: Option<Provenance>,
    seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BufferUploadPolicyStats {
    pub staged_writes: u64,
    pub staged_bytes: u64,
    pub flushed_writes: u64,
    pub flushed_bytes: u64,
    pub merged_writes: u64,
    pub overlap_events: u64,
    pub overlap_bytes: u64,
}

#[derive(Default)]
pub struct BufferUploadPolicyState {
    tag: UploadPolicyTag,
    current_size: u64,
    scratch: Vec<u8>,
    shadow: Option<Vec<u8>>,
    /// `Coalesced`: appended, unmerged, merged once at flush.
    pending: Vec<DirtyRange>,
    /// `CoalescedRetained`: kept sorted and minimal as writes arrive.
    retained_dirty: Vec<DirtyRange>,
    next_seq: u64,
    staged_writes: u64,
    staged_bytes: u64,
    last_flush_stats: BufferUploadPolicyStats,
}

impl BufferUploadPolicyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&self) -> UploadPolicyTag {
        self.tag
    }

    /// Reshapes scratch/shadow for `tag`; clears any staged-but-unflushed
    /// state when switching policies.
    pub fn set_policy(&mut self, tag: UploadPolicyTag, current_size: u64) {
        self.tag = tag;
        self.current_size = current_size;
        self.scratch = vec![0u8; current_size as usize];
        self.shadow = matches!(tag, UploadPolicyTag::CoalescedRetained).then(|| vec![0u8; current_size as usize]);
        self.pending.clear();
        self.retained_dirty.clear();
        self.staged_writes = 0;
        self.staged_bytes = 0;
    }

    /// Grows/shrinks scratch and (for `CoalescedRetained`) the shadow,
    /// preserving existing bytes and pending retained dirty ranges.
    pub fn on_buffer_resized(&mut self, new_size: u64) {
        self.current_size = new_size;
        self.scratch.resize(new_size as usize, 0);
        if let Some(shadow) = &mut self.shadow {
            shadow.resize(new_size as usize, 0);
        }
        for range in &mut self.retained_dirty {
            range.end = range.end.min(new_size);
            range.begin = range.begin.min(range.end);
        }
        self.retained_dirty.retain(|r| r.begin < r.end);
    }

    /// Staged writes must survive until the next flush regardless of
    /// whether a frame has begun — this is an intentional no-op.
    pub fn begin_frame(&self) {}

    /// Returns `Ok(true)` if the write was staged, `Ok(false)` for
    /// `Immediate` (caller must upload directly via the recorder).
    pub fn stage_write(&mut self, data: &[u8], offset: u64) -> Result<bool> {
        let size = data.len() as u64;
        if offset + size > self.current_size {
            return Err(UploadStatsError::OutOfBounds {
                offset,
                size,
                limit: self.current_size,
            });
        }

        match self.tag {
            UploadPolicyTag::Immediate => Ok(false),
            UploadPolicyTag::Coalesced => {
                self.scratch[offset as usize..(offset + size) as usize].copy_from_slice(data);
                let seq = self.next_seq;
                self.next_seq += 1;
                self.pending.push(DirtyRange {
                    begin: offset,
                    end: offset + size,
                    provenance: Provenance::capture(),
                    seq,
                });
                self.staged_writes += 1;
                self.staged_bytes += size;
                Ok(true)
            }
            UploadPolicyTag::CoalescedRetained => {
                self.scratch[offset as usize..(offset + size) as usize].copy_from_slice(data);
                if let Some(shadow) = &mut self.shadow {
                    shadow[offset as usize..(offset + size) as usize].copy_from_slice(data);
                }
                let seq = self.next_seq;
                self.next_seq += 1;
                add_or_merge_dirty_range(
                    &mut self.retained_dirty,
                    DirtyRange {
                        begin: offset,
                        end: offset + size,
                        provenance: Provenance::capture(),
                        seq,
                    },
                );
                self.staged_writes += 1;
                self.staged_bytes += size;
                Ok(true)
            }
        }
    }

    /// Merges staged dirty ranges and issues uploads through `recorder`.
    /// `Coalesced` uploads from scratch and resets all staged state;
    /// `CoalescedRetained` uploads from the shadow and keeps it, clearing
    /// only the dirty range list.
    pub fn flush_to_upload_service(&mut self, target: UploadTarget, recorder: &mut UploadRecorder) -> Result<BufferUploadPolicyStats> {
        let stats = match self.tag {
            UploadPolicyTag::Immediate => BufferUploadPolicyStats::default(),
            UploadPolicyTag::Coalesced => {
                let (merged, overlap) = coalesce_dirty_ranges(std::mem::take(&mut self.pending));
                let mut flushed_bytes = 0u64;
                for range in &merged {
                    recorder.upload_data(&self.scratch[range.begin as usize..range.end as usize], target.clone(), range.begin)?;
                    flushed_bytes += range.end - range.begin;
                }
                let stats = BufferUploadPolicyStats {
                    staged_writes: self.staged_writes,
                    staged_bytes: self.staged_bytes,
                    flushed_writes: merged.len() as u64,
                    flushed_bytes,
                    merged_writes: self.staged_writes.saturating_sub(merged.len() as u64),
                    overlap_events: overlap.events,
                    overlap_bytes: overlap.bytes,
                };
                self.staged_writes = 0;
                self.staged_bytes = 0;
                stats
            }
            UploadPolicyTag::CoalescedRetained => {
                let shadow = self.shadow.as_ref().expect("CoalescedRetained always has a shadow");
                let mut flushed_bytes = 0u64;
                for range in &self.retained_dirty {
                    recorder.upload_data(&shadow[range.begin as usize..range.end as usize], target.clone(), range.begin)?;
                    flushed_bytes += range.end - range.begin;
                }
                let stats = BufferUploadPolicyStats {
                    staged_writes: self.staged_writes,
                    staged_bytes: self.staged_bytes,
                    flushed_writes: self.retained_dirty.len() as u64,
                    flushed_bytes,
                    merged_writes: self.staged_writes.saturating_sub(self.retained_dirty.len() as u64),
                    overlap_events: 0,
                    overlap_bytes: 0,
                };
                self.retained_dirty.clear();
                self.staged_writes = 0;
                self.staged_bytes = 0;
                stats
            }
        };
        self.last_flush_stats = stats;
        Ok(stats)
    }

    pub fn get_last_flush_stats(&self) -> BufferUploadPolicyStats {
        self.last_flush_stats
    }
}

struct OverlapStats {
    events: u64,
    bytes: u64,
}

/// Sorts by `begin`, merges any two ranges where `curr.begin <= tail.end`,
/// keeping the provenance of whichever had the higher `seq` (newest wins —
/// see DESIGN.md for why this, rather than oldest, is preserved).
fn coalesce_dirty_ranges(mut ranges: Vec<DirtyRange>) -> (Vec<DirtyRange>, OverlapStats) {
    ranges.sort_by_key(|r| r.begin);
    let mut out: Vec<DirtyRange> = Vec::with_capacity(ranges.len());
    let mut overlap = OverlapStats { events: 0, bytes: 0 };

    for r in ranges {
        if let Some(tail) = out.last_mut() {
            if r.begin <= tail.end {
                if r.begin < tail.end {
                    overlap.events += 1;
                    overlap.bytes += tail.end.min(r.end).saturating_sub(r.begin);
                }
                tail.end = tail.end.max(r.end);
                if r.seq > tail.seq {
                    tail.provenance = r.provenance;
                    tail.seq = r.seq;
                }
                continue;
            }
        }
        out.push(r);
    }
    (out, overlap)
}

/// Merge-inserts `new` into the sorted, disjoint `list` in place.
/// `new`'s provenance always wins on merge since it is, by construction,
/// the most recently staged write.
fn add_or_merge_dirty_range(list: &mut Vec<DirtyRange>, new: DirtyRange) {
    let mut begin = new.begin;
    let mut end = new.end;
    let mut result = Vec::with_capacity(list.len() + 1);
    let mut inserted = false;

    for r in list.drain(..) {
        if r.end < begin {
            result.push(r);
        } else if r.begin > end {
            if !inserted {
                result.push(DirtyRange {
                    begin,
                    end,
                    provenance: new.provenance,
                    seq: new.seq,
                });
                inserted = true;
            }
            result.push(r);
        } else {
            begin = begin.min(r.begin);
            end = end.max(r.end);
        }
    }
    if !inserted {
        result.push(DirtyRange {
            begin,
            end,
            provenance: new.provenance,
            seq: new.seq,
        });
    }
    *list = result;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::test_support::{FakeBuffer, FakeDevice};
    use crate::upload::page::RingPager;
    use crate::upload::recorder::UploadRecorderConfig;
    use std::sync::Arc;

    fn recorder_and_target(size: u64) -> (UploadRecorder, UploadTarget, Arc<FakeBuffer>) {
        let device: Arc<dyn crate::rhi::Device> = Arc::new(FakeDevice::default());
        let pager = RingPager::new(device, 1, 1 << 16).unwrap();
        let rec = UploadRecorder::new(pager, UploadRecorderConfig::default());
        let buf = Arc::new(FakeBuffer::new(size));
        (rec, UploadTarget::from_shared(buf.clone()), buf)
    }

    #[test]
    fn immediate_policy_does_not_stage() {
        let mut state = BufferUploadPolicyState::new();
        state.set_policy(UploadPolicyTag::Immediate, 64);
        let handled = state.stage_write(&[1, 2, 3], 0).unwrap();
        assert!(!handled);
    }

    #[test]
    fn coalesced_flush_covers_exactly_the_staged_union() {
        let mut state = BufferUploadPolicyState::new();
        state.set_policy(UploadPolicyTag::Coalesced, 128);
        state.stage_write(&[1u8; 16], 0).unwrap();
        state.stage_write(&[2u8; 16], 16).unwrap();
        state.stage_write(&[3u8; 16], 64).unwrap();

        let (mut rec, target, dest) = recorder_and_target(128);
        let stats = state.flush_to_upload_service(target, &mut rec).unwrap();
        assert_eq!(stats.staged_writes, 3);
        assert_eq!(stats.flushed_writes, 2, "the first two writes are contiguous and merge");

        let mut cmd = crate::rhi::test_support::FakeCommandList::new();
        rec.execute_upload_pass(&mut cmd).unwrap();
        assert_eq!(&dest.read(0, 16), &[1u8; 16]);
        assert_eq!(&dest.read(16, 16), &[2u8; 16]);
        assert_eq!(&dest.read(64, 16), &[3u8; 16]);
    }

    #[test]
    fn retained_policy_keeps_shadow_and_clears_only_dirty_list() {
        let mut state = BufferUploadPolicyState::new();
        state.set_policy(UploadPolicyTag::CoalescedRetained, 32);
        state.stage_write(&[9u8; 8], 0).unwrap();

        let (mut rec, target, _dest) = recorder_and_target(32);
        state.flush_to_upload_service(target.clone(), &mut rec).unwrap();
        assert!(state.retained_dirty.is_empty());
        assert!(state.shadow.is_some());

        // A second flush with nothing newly dirty issues no uploads.
        let stats = state.flush_to_upload_service(target, &mut rec).unwrap();
        assert_eq!(stats.flushed_writes, 0);
    }

    #[test]
    fn switching_away_from_retained_clears_the_shadow() {
        let mut state = BufferUploadPolicyState::new();
        state.set_policy(UploadPolicyTag::CoalescedRetained, 16);
        state.stage_write(&[1u8; 4], 0).unwrap();
        state.set_policy(UploadPolicyTag::Immediate, 16);
        assert!(state.shadow.is_none());
        assert!(state.retained_dirty.is_empty());
    }

    #[test]
    fn out_of_bounds_write_is_rejected_synchronously() {
        let mut state = BufferUploadPolicyState::new();
        state.set_policy(UploadPolicyTag::Coalesced, 16);
        let err = state.stage_write(&[0u8; 8], 12).unwrap_err();
        assert!(matches!(err, UploadStatsError::OutOfBounds { .. }));
    }

    #[test]
    fn add_or_merge_keeps_the_dirty_set_minimal_and_newest_wins() {
        let mut list = Vec::new();
        add_or_merge_dirty_range(&mut list, DirtyRange { begin: 0, end: 10, provenance: None, seq: 0 });
        add_or_merge_dirty_range(&mut list, DirtyRange { begin: 20, end: 30, provenance: None, seq: 1 });
        add_or_merge_dirty_range(&mut list, DirtyRange { begin: 8, end: 22, provenance: None, seq: 2 });

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].begin, 0);
        assert_eq!(list[0].end, 30);
        assert_eq!(list[0].seq, 2);
    }
}
