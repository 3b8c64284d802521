// Shared region layout constants.
// Must match the worker and client exactly; the flag protocol assumes
// these offsets on both sides of the process boundary.

/// Total size of the shared region.
pub const REGION_SIZE: usize = 256 * 1024 * 1024;

/// POSIX name of the shared region (a file of this name under /dev/shm).
pub const REGION_NAME: &str = "fastllm_shm";

/// Input staging area (client writes, workers read).
pub const OFFSET_INPUT: usize = 0x000000;
pub const SIZE_INPUT: usize = 128 * 1024 * 1024;

/// Output staging area (workers write, client reads).
pub const OFFSET_OUTPUT: usize = 128 * 1024 * 1024;
pub const SIZE_OUTPUT: usize = 127 * 1024 * 1024;

/// Flag pages, one per worker. A flag is the first 4 bytes of its page:
/// 0 = idle, nonzero = task code.
pub const OFFSET_FLAGS: usize = 255 * 1024 * 1024;
pub const FLAG_PAGE: usize = 64 * 1024;
pub const MAX_WORKERS: usize = (REGION_SIZE - OFFSET_FLAGS) / FLAG_PAGE;

/// Control replies (ServerInfo, FindData) use one 4 KiB slot per worker at
/// the head of the output region.
pub const CONTROL_SLOT: usize = 4096;

/// KV cache capacity alignment.
pub const KV_CAP_ALIGN: usize = 128;

/// Byte offset of worker `i`'s flag word from the region base.
pub const fn flag_offset(worker: usize) -> usize {
    OFFSET_FLAGS + worker * FLAG_PAGE
}

/// Align `offset` up to `alignment` (power of two).
pub const fn align_offset(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Shard range `[base, base + local)` along an axis of `total` rows for
/// worker `part_id` of `part_cnt`; the last worker absorbs the remainder.
/// Both sides of the mailbox derive band sizes from this.
pub const fn shard_range(total: usize, part_id: usize, part_cnt: usize) -> (usize, usize) {
    let per = total / part_cnt;
    let base = part_id * per;
    let local = if part_id == part_cnt - 1 {
        total - base
    } else {
        per
    };
    (base, local)
}

/// Validate that `[offset, offset+size)` fits in the region.
pub fn validate_offset(offset: usize, size: usize) -> Result<(), String> {
    if offset + size > REGION_SIZE {
        return Err(format!(
            "Offset {} + size {} exceeds region size {}",
            offset, size, REGION_SIZE
        ));
    }
    Ok(())
}

/// Get region name for an offset (diagnostics only).
pub fn get_region_name(offset: usize) -> &'static str {
    match offset {
        o if o < OFFSET_OUTPUT => "Input",
        o if o < OFFSET_FLAGS => "Output",
        _ => "Flags",
    }
}
