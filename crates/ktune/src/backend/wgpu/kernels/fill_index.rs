pub const FILL_INDEX_WGSL: &str = r#"
struct Params {
    offset: vec4<u32>,
    global: vec4<u32>,
    args: array<vec4<u32>, 4>,
};

#ifdef OUT_OF_RANGE_CHECK
@group(0) @binding(0) var<storage, read_write> oob_flag: array<atomic<i32>>;
@group(0) @binding(4) var<storage, read_write> output: array<@SCALAR@>;
#else
@group(0) @binding(3) var<storage, read_write> output: array<@SCALAR@>;
#endif
@group(0) @binding(15) var<uniform> params: Params;

@compute @workgroup_size(@WG_X@, @WG_Y@, @WG_Z@)
fn @fill_index@(@builtin(global_invocation_id) id: vec3<u32>) {
    let gid = id + params.offset.xyz;
    let g0 = params.args[0].x;
    let g1 = params.args[0].y;
    let g2 = params.args[0].z;
    if (gid.x >= g0 || gid.y >= g1 || gid.z >= g2) {
        return;
    }
    let idx = (gid.z * g1 + gid.y) * g0 + gid.x;
    output[idx] = @SCALAR@(gid.x + 7u * gid.y + 31u * gid.z + 1u);
}
"#;
