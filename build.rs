//! Build script: flag ARMv6-M targets so the port picks the PRIMASK and
//! Thumb-1 code paths.

use std::env;

fn main() {
    println!("cargo:rustc-check-cfg=cfg(armv6m)");
    let target = env::var("TARGET").unwrap_or_default();
    if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
    }
    println!("cargo:rerun-if-changed=build.rs");
}
