pub const CUSTOM_ADD_WGSL: &str = r#"
struct Params {
    offset: vec4<u32>,
    global: vec4<u32>,
    args: array<vec4<u32>, 4>,
};

#ifdef OUT_OF_RANGE_CHECK
@group(0) @binding(0) var<storage, read_write> oob_flag: array<atomic<i32>>;
@group(0) @binding(3) var<storage, read_write> input0: array<@SCALAR@>;
@group(0) @binding(4) var<storage, read_write> input1: array<@SCALAR@>;
@group(0) @binding(8) var<storage, read_write> output: array<@SCALAR@>;
#else
@group(0) @binding(2) var<storage, read_write> input0: array<@SCALAR@>;
@group(0) @binding(3) var<storage, read_write> input1: array<@SCALAR@>;
@group(0) @binding(7) var<storage, read_write> output: array<@SCALAR@>;
#endif
@group(0) @binding(15) var<uniform> params: Params;

fn store_output(index: u32, value: @SCALAR@) {
#ifdef OUT_OF_RANGE_CHECK
    if (index >= arrayLength(&output)) {
        atomicStore(&oob_flag[0], 1);
        return;
    }
#endif
    output[index] = value;
}

@compute @workgroup_size(@WG_X@, @WG_Y@, @WG_Z@)
fn @custom_add@(@builtin(global_invocation_id) id: vec3<u32>) {
    let x = id.x + params.offset.x;
    let hb = id.y + params.offset.y;
    if (x >= params.args[0].x || hb >= params.args[0].y) {
        return;
    }
    let repeat = bitcast<i32>(params.args[0].z);
    let width = max(params.args[0].w, 1u);
    let channels = params.args[1].x;
    let ch_blk = x / width;
    let w = x % width;
    for (var i = 0u; i < 4u; i = i + 1u) {
        let c = ch_blk * 4u + i;
        if (c >= channels) {
            break;
        }
        let idx = (hb * width + w) * channels + c;
        var value = input0[idx];
        let addend = input1[idx];
        for (var r = 0; r < repeat; r = r + 1) {
            value = value + addend;
        }
        store_output(idx, value);
    }
}
"#;
