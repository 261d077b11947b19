use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Key of a specialised pipeline: the preprocessed source, the exported
/// symbol, the work-group size and the binding layout it was built for.
pub fn compute_pipeline_hash(
    source: &str,
    symbol: &str,
    workgroup_size: [u32; 3],
    layout_tag: &str,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    symbol.hash(&mut hasher);
    workgroup_size.hash(&mut hasher);
    layout_tag.hash(&mut hasher);
    hasher.finish()
}
