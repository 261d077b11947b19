//! WGSL program templates, looked up by program source name.
//!
//! Conventions shared by every template:
//! * buffer argument `i` is declared at `@binding(i)` as `read_write` storage
//! * `@binding(15)` holds [`PARAMS_BINDING`] uniforms: the launch offset and
//!   global size followed by the scalar arguments in argument order, packed
//!   four per `vec4<u32>`
//! * `@SCALAR@` is the element type, `@WG_X@`/`@WG_Y@`/`@WG_Z@` the
//!   work-group size

mod custom_add;
mod fill_index;

/// Binding index of the launch-parameter uniform.
pub const PARAMS_BINDING: u32 = 15;
/// Maximum number of scalar arguments a kernel may take.
pub const MAX_SCALAR_ARGS: usize = 16;

pub fn template(source_name: &str) -> Option<&'static str> {
    match source_name {
        "custom_add" => Some(custom_add::CUSTOM_ADD_WGSL),
        "fill_index" => Some(fill_index::FILL_INDEX_WGSL),
        _ => None,
    }
}
