//! Launch geometry: local work-group sizes, optional block size, and the
//! candidate sets explored by the tuner.

use std::collections::HashSet;

use ktune_api::{DispatchError, Result};
use serde::{Deserialize, Serialize};

/// Reference global-memory cache size used to scale default local sizes.
pub const BASE_GPU_MEM_CACHE_SIZE: u64 = 16_384;

/// Local sizes for a 2-D or 3-D launch plus the block size chosen when the
/// launch is split along its slowest-varying axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchGeometry {
    pub local: Vec<u32>,
    pub block_size: Option<u32>,
}

impl LaunchGeometry {
    pub fn new(local: Vec<u32>) -> Self {
        Self {
            local,
            block_size: None,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn dims(&self) -> usize {
        self.local.len()
    }

    pub fn work_group_size(&self) -> u64 {
        self.local.iter().map(|&l| l as u64).product()
    }

    /// Flat parameter form stored in the tuning table: the local sizes
    /// followed by the block size (0 when the launch is not split).
    pub fn to_params(&self) -> Vec<u32> {
        let mut params = self.local.clone();
        params.push(self.block_size.unwrap_or(0));
        params
    }

    pub fn from_params(params: &[u32], dims: usize) -> Result<Self> {
        if params.len() != dims + 1 {
            return Err(DispatchError::InvalidGeometry(format!(
                "expected {} tuning parameters for a {dims}-D launch, found {}",
                dims + 1,
                params.len()
            )));
        }
        let block = params[dims];
        Ok(Self {
            local: params[..dims].to_vec(),
            block_size: (block > 0).then_some(block),
        })
    }
}

#[inline]
pub fn round_up(value: u32, factor: u32) -> u32 {
    if factor == 0 {
        return value;
    }
    value.div_ceil(factor) * factor
}

#[inline]
pub fn round_up_div4(value: u32) -> u32 {
    value.div_ceil(4)
}

/// Keeps candidates whose work-group fits `kwg`, first occurrence only.
fn retain_viable(candidates: Vec<Vec<u32>>, kwg: u32) -> Vec<LaunchGeometry> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|local| {
            let total: u64 = local.iter().map(|&l| l as u64).product();
            total > 0 && total <= kwg as u64
        })
        .filter(|local| seen.insert(local.clone()))
        .map(LaunchGeometry::new)
        .collect()
}

/// Candidate local sizes for a 2-D launch, in evaluation order.
pub fn candidates_2d(kwg: u32) -> Vec<LaunchGeometry> {
    let mut raw: Vec<Vec<u32>> = [2u32, 4, 8, 16, 32, 64, 128, 256]
        .iter()
        .map(|&d| vec![kwg / d, d])
        .collect();
    raw.push(vec![kwg, 1]);
    raw.push(vec![1, kwg]);
    retain_viable(raw, kwg)
}

/// Candidate local sizes for a 3-D launch, in evaluation order.
pub fn candidates_3d(gws: &[u32], kwg: u32) -> Vec<LaunchGeometry> {
    let (g0, g1, g2) = (gws[0], gws[1], gws[2]);
    let axis0 = [g0, g0 / 4, g0 / 8, 4, 1];
    let axis2 = [g2, g2 / 8, g2 / 4, 8, 4, 1];
    let mut raw = Vec::with_capacity(axis0.len() * axis2.len());
    for &l0 in &axis0 {
        for &l2 in &axis2 {
            raw.push(vec![l0, g1, l2]);
        }
    }
    retain_viable(raw, kwg)
}

/// Default local size for a 3-D launch scaled to the device's global memory
/// cache.
pub fn default_3d_local_ws(gws: &[u32], kwg: u32, global_mem_cache_size: u64) -> Vec<u32> {
    if kwg == 0 {
        return vec![1, 1, 1];
    }
    let base = (global_mem_cache_size / BASE_GPU_MEM_CACHE_SIZE).clamp(1, u32::MAX as u64) as u32;
    let l1 = gws[1].min(kwg).max(1);
    let l2 = gws[2].min(base).min(kwg / l1).max(1);
    let l0 = base.min(kwg / (l1 * l2)).max(1).min(gws[0]).max(1);
    vec![l0, l1, l2]
}
