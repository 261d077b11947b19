//! Splitting of long launches into blocks along the slowest-varying axis.

use crate::geometry::round_up;

/// One block of a split launch along the slowest-varying axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u32,
    pub len: u32,
}

/// Choose a block size for a launch that took `elapsed_us` against a ceiling
/// of `ceiling_us`. Returns `None` when the launch should stay whole.
///
/// `len` is the logical extent of the slowest axis, `internal_len` the extent
/// actually enqueued (rounded up to `local` without non-uniform work-groups).
pub fn plan_block_size(
    elapsed_us: f64,
    ceiling_us: f64,
    len: u32,
    internal_len: u32,
    local: u32,
    non_uniform: bool,
) -> Option<u32> {
    if ceiling_us.is_nan() || ceiling_us <= 0.0 || elapsed_us <= ceiling_us || len <= 1 {
        return None;
    }
    let wanted = (elapsed_us / ceiling_us).ceil();
    let num_blocks = if wanted >= len as f64 {
        len
    } else {
        wanted as u32
    }
    .max(1);
    let mut block = (len / num_blocks).max(1);
    if !non_uniform {
        block = round_up(block, local.max(1));
    }
    if internal_len.div_ceil(block) <= 1 {
        return None;
    }
    Some(block)
}

/// Blocks covering `[0, internal_len)`; the last one is clipped.
pub fn blocks(internal_len: u32, block_size: u32) -> Vec<Block> {
    if block_size == 0 || block_size >= internal_len {
        return vec![Block {
            offset: 0,
            len: internal_len,
        }];
    }
    let count = internal_len.div_ceil(block_size);
    (0..count)
        .map(|i| {
            let offset = i * block_size;
            Block {
                offset,
                len: block_size.min(internal_len - offset),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_launch_is_not_split() {
        assert_eq!(plan_block_size(500.0, 1000.0, 64, 64, 4, true), None);
        assert_eq!(plan_block_size(1000.0, 1000.0, 64, 64, 4, true), None);
    }

    #[test]
    fn slow_launch_splits_by_ratio() {
        // 3.5x over budget -> 4 blocks of 16
        assert_eq!(plan_block_size(3500.0, 1000.0, 64, 64, 4, true), Some(16));
    }

    #[test]
    fn block_count_capped_by_extent() {
        assert_eq!(plan_block_size(1.0e9, 1.0, 6, 6, 1, true), Some(1));
    }

    #[test]
    fn uniform_rounds_block_to_local() {
        // 3 blocks of 33 -> rounded to 36
        let b = plan_block_size(2500.0, 1000.0, 100, 100, 12, false).expect("split");
        assert_eq!(b, 36);
        assert_eq!(b % 12, 0);
    }

    #[test]
    fn rounding_that_swallows_extent_cancels_split() {
        assert_eq!(plan_block_size(4.0, 1.0, 2, 16, 16, false), None);
    }

    #[test]
    fn blocks_cover_range_exactly() {
        let bs = blocks(100, 36);
        assert_eq!(
            bs,
            vec![
                Block { offset: 0, len: 36 },
                Block { offset: 36, len: 36 },
                Block { offset: 72, len: 28 },
            ]
        );
        let total: u32 = bs.iter().map(|b| b.len).sum();
        assert_eq!(total, 100);
        assert_eq!(blocks(10, 0), vec![Block { offset: 0, len: 10 }]);
        assert_eq!(blocks(10, 10).len(), 1);
    }
}
