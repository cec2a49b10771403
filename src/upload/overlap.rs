//! The Overlap Resolver: last-write-wins merge of overlapping buffer
//! writes to the same destination.
//!
//! Ported from `UploadManager::ApplyLastWriteWins` /
//! `TryCoalesceAppend` / `RangesOverlap` / `RangeContains`. The original
//! keeps this path commented out on the hot loop (`// Too slow`) and only
//! runs it as a debug-gated alternative to contiguous-append coalescing;
//! see `UploadRecorderConfig::last_write_wins_on_flush`.

use std::sync::Arc;

use crate::rhi::GpuBuffer;
use crate::upload::page::RingPager;
use crate::upload::update::BufferUpdate;

fn ranges_overlap(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn range_contains(outer: (u64, u64), inner: (u64, u64)) -> bool {
    outer.0 <= inner.0 && inner.1 <= outer.1
}

/// Applies last-write-wins semantics to `updates` in place: `incoming` is
/// merged against every *active* prior record targeting the same
/// destination, scanned newest-first. Records absorbed by the merge are
/// marked inactive; `incoming` itself may be replaced by a freshly
/// allocated union region. Returns the (possibly rewritten) incoming record
/// to append.
pub fn apply_last_write_wins(
    updates: &mut [BufferUpdate],
    pager: &mut RingPager,
    mut incoming: BufferUpdate,
) -> crate::error::Result<BufferUpdate> {
    let mut new_range = incoming.dest_range();

    for existing in updates.iter_mut().rev() {
        if !existing.active || existing.destination != incoming.destination {
            continue;
        }
        let existing_range = existing.dest_range();
        if !ranges_overlap(existing_range, new_range) {
            continue;
        }

        if range_contains(existing_range, new_range) {
            // Old fully contains new: patch old's staging bytes in place
            // with the new write, then drop the new record entirely.
            let patch_offset = existing.upload_offset + (new_range.0 - existing_range.0);
            copy_staging_bytes(&incoming.upload_page, incoming.upload_offset, &existing.upload_page, patch_offset, incoming.size);
            incoming.active = false;
            return Ok(incoming);
        } else if range_contains(new_range, existing_range) {
            // New fully contains old: old is entirely superseded.
            existing.active = false;
        } else {
            // Partial overlap: allocate a union region covering both,
            // seed it with old's bytes, then overwrite the intersection
            // with new's bytes.
            let union_begin = existing_range.0.min(new_range.0);
            let union_end = existing_range.1.max(new_range.1);
            let union_size = union_end - union_begin;

            let alloc = pager.allocate(union_size, 16)?;

            let old_src_offset = existing.upload_offset;
            copy_staging_bytes(
                &existing.upload_page,
                old_src_offset,
                &alloc.buffer,
                alloc.offset + (existing_range.0 - union_begin),
                existing.size,
            );
            copy_staging_bytes(
                &incoming.upload_page,
                incoming.upload_offset,
                &alloc.buffer,
                alloc.offset + (new_range.0 - union_begin),
                incoming.size,
            );

            existing.active = false;
            incoming.upload_page = alloc.buffer;
            incoming.upload_offset = alloc.offset;
            incoming.dest_offset = union_begin;
            incoming.size = union_size;
            new_range = (union_begin, union_end);
        }
    }

    Ok(incoming)
}

fn copy_staging_bytes(src: &Arc<dyn GpuBuffer>, src_offset: u64, dst: &Arc<dyn GpuBuffer>, dst_offset: u64, size: u64) {
    if size == 0 {
        return;
    }
    unsafe {
        let src_ptr = src.map(src_offset, size);
        let bytes = std::slice::from_raw_parts(src_ptr, size as usize).to_vec();
        src.unmap();
        let dst_ptr = dst.map(dst_offset, size);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst_ptr, size as usize);
        dst.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::test_support::FakeDevice;
    use crate::rhi::{BufferDesc, Device, MemoryUsage};
    use crate::upload::target::UploadTarget;

    fn staged_update(device: &FakeDevice, dest: UploadTarget, dest_offset: u64, size: u64, fill: u8) -> BufferUpdate {
        let page = device.create_buffer(BufferDesc {
            size: size.max(1),
            memory_usage: MemoryUsage::CpuToGpu,
        });
        unsafe {
            let ptr = page.map(0, size);
            std::ptr::write_bytes(ptr, fill, size as usize);
            page.unmap();
        }
        BufferUpdate {
            destination: dest,
            upload_page: page,
            upload_offset: 0,
            dest_offset,
            size,
            active: true,
            provenance: None,
        }
    }

    fn dest_target() -> UploadTarget {
        UploadTarget::from_shared(Arc::new(crate::rhi::test_support::FakeBuffer::new(256)))
    }

    fn pager(device: &Arc<FakeDevice>) -> RingPager {
        RingPager::new(device.clone(), 1, 4096).unwrap()
    }

    fn read_bytes(buf: &Arc<dyn GpuBuffer>, offset: u64, len: u64) -> Vec<u8> {
        unsafe {
            let ptr = buf.map(offset, len);
            let bytes = std::slice::from_raw_parts(ptr, len as usize).to_vec();
            buf.unmap();
            bytes
        }
    }

    #[test]
    fn partial_overlap_union_keeps_old_bytes_outside_the_overlap_and_new_inside() {
        let device = Arc::new(FakeDevice::default());
        let mut pager = pager(&device);
        let dest = dest_target();

        let mut updates = vec![staged_update(&device, dest.clone(), 0, 32, b'X')];
        let incoming = staged_update(&device, dest.clone(), 16, 32, b'Y');

        let pages_before = pager.page_count();
        let resolved = apply_last_write_wins(&mut updates, &mut pager, incoming).unwrap();
        assert!(!updates[0].active);
        updates.push(resolved);

        let merged = updates.last().unwrap();
        assert_eq!(merged.dest_offset, 0);
        assert_eq!(merged.size, 48);
        let bytes = read_bytes(&merged.upload_page, merged.upload_offset, 48);
        assert_eq!(&bytes[0..16], &[b'X'; 16]);
        assert_eq!(&bytes[16..48], &[b'Y'; 32]);
        assert_eq!(pager.page_count(), pages_before, "union must come from the existing ring, not a side allocation");
    }

    #[test]
    fn new_fully_contained_in_old_patches_old_in_place_and_drops_new() {
        let device = Arc::new(FakeDevice::default());
        let mut pager = pager(&device);
        let dest = dest_target();

        let mut updates = vec![staged_update(&device, dest.clone(), 0, 64, b'X')];
        let incoming = staged_update(&device, dest.clone(), 16, 16, b'Y');

        let resolved = apply_last_write_wins(&mut updates, &mut pager, incoming).unwrap();
        assert!(!resolved.active);

        let patched = read_bytes(&updates[0].upload_page, 0, 64);
        assert_eq!(&patched[0..16], &[b'X'; 16]);
        assert_eq!(&patched[16..32], &[b'Y'; 16]);
        assert_eq!(&patched[32..64], &[b'X'; 32]);
    }

    #[test]
    fn disjoint_ranges_are_left_untouched() {
        let device = Arc::new(FakeDevice::default());
        let mut pager = pager(&device);
        let dest = dest_target();

        let mut updates = vec![staged_update(&device, dest.clone(), 0, 16, b'X')];
        let incoming = staged_update(&device, dest.clone(), 32, 16, b'Y');

        let resolved = apply_last_write_wins(&mut updates, &mut pager, incoming).unwrap();
        assert!(updates[0].active);
        assert_eq!(resolved.dest_offset, 32);
        assert_eq!(resolved.size, 16);
    }
}
