//! Minimal WGSL source preprocessor.
//!
//! Supports `#ifdef NAME`, `#ifndef NAME`, `#else` and `#endif` on lines of
//! their own, and replaces `@NAME@` with the value of each valued define.
//! Work-group sentinels (`@WG_X@`, `@WG_Y@`, `@WG_Z@`) are left for
//! [`specialize_workgroup`].

use ktune_api::BuildOptions;

struct Frame {
    parent_active: bool,
    branch_taken: bool,
    in_else: bool,
}

pub fn preprocess(source: &str, options: &BuildOptions) -> Result<String, String> {
    let mut out = String::with_capacity(source.len());
    let mut stack: Vec<Frame> = Vec::new();
    let mut active = true;

    for (lineno, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix('#') {
            let mut parts = rest.split_whitespace();
            let directive = parts.next().unwrap_or("");
            let arg = parts.next();
            match directive {
                "ifdef" | "ifndef" => {
                    let name = arg.ok_or_else(|| {
                        format!("line {}: #{directive} without a name", lineno + 1)
                    })?;
                    let defined = options.is_defined(name);
                    let cond = if directive == "ifdef" { defined } else { !defined };
                    stack.push(Frame {
                        parent_active: active,
                        branch_taken: cond,
                        in_else: false,
                    });
                    active = active && cond;
                }
                "else" => {
                    let frame = stack
                        .last_mut()
                        .ok_or_else(|| format!("line {}: #else without #ifdef", lineno + 1))?;
                    if frame.in_else {
                        return Err(format!("line {}: duplicate #else", lineno + 1));
                    }
                    frame.in_else = true;
                    active = frame.parent_active && !frame.branch_taken;
                }
                "endif" => {
                    let frame = stack
                        .pop()
                        .ok_or_else(|| format!("line {}: #endif without #ifdef", lineno + 1))?;
                    active = frame.parent_active;
                }
                other => {
                    return Err(format!("line {}: unknown directive #{other}", lineno + 1));
                }
            }
            continue;
        }
        if !active {
            continue;
        }
        let mut rendered = line.to_string();
        if rendered.contains('@') {
            for (name, value) in options.iter() {
                if let Some(value) = value {
                    rendered = rendered.replace(&format!("@{name}@"), value);
                }
            }
        }
        out.push_str(&rendered);
        out.push('\n');
    }

    if !stack.is_empty() {
        return Err(format!("{} unterminated #ifdef block(s)", stack.len()));
    }
    Ok(out)
}

/// Substitute the work-group size sentinels.
pub fn specialize_workgroup(source: &str, local: [u32; 3]) -> String {
    source
        .replace("@WG_X@", &local[0].to_string())
        .replace("@WG_Y@", &local[1].to_string())
        .replace("@WG_Z@", &local[2].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(defines: &[(&str, Option<&str>)]) -> BuildOptions {
        let mut o = BuildOptions::new();
        for (name, value) in defines {
            match value {
                Some(v) => o.define_value(*name, *v),
                None => o.define(*name),
            };
        }
        o
    }

    #[test]
    fn selects_branches() {
        let src = "a\n#ifdef CHECK\nb\n#else\nc\n#endif\nd\n";
        assert_eq!(preprocess(src, &opts(&[("CHECK", None)])).expect("pp"), "a\nb\nd\n");
        assert_eq!(preprocess(src, &opts(&[])).expect("pp"), "a\nc\nd\n");
    }

    #[test]
    fn nested_inactive_parent_stays_inactive() {
        let src = "#ifdef A\n#ifndef B\nx\n#else\ny\n#endif\n#endif\nz\n";
        assert_eq!(preprocess(src, &opts(&[])).expect("pp"), "z\n");
        assert_eq!(preprocess(src, &opts(&[("A", None)])).expect("pp"), "x\nz\n");
    }

    #[test]
    fn substitutes_valued_defines_and_keeps_sentinels() {
        let src = "fn @entry@() -> @SCALAR@ {} @WG_X@";
        let out = preprocess(src, &opts(&[("entry", Some("k12")), ("SCALAR", Some("f32"))]))
            .expect("pp");
        assert_eq!(out, "fn k12() -> f32 {} @WG_X@\n");
        assert_eq!(specialize_workgroup(&out, [8, 4, 1]), "fn k12() -> f32 {} 8\n");
    }

    #[test]
    fn unbalanced_blocks_are_errors() {
        assert!(preprocess("#ifdef A\nx\n", &opts(&[])).is_err());
        assert!(preprocess("#endif\n", &opts(&[])).is_err());
        assert!(preprocess("#pragma once\n", &opts(&[])).is_err());
    }
}
