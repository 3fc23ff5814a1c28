//! Build script for the ORT predictor
//!
//! Compiles the C++ ONNX Runtime shim and links it with Rust. Without the
//! `ffi` feature the crate runs against its in-process mock engine and
//! nothing native is built.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=csrc/");
    println!("cargo:rerun-if-env-changed=ONNXRUNTIME_DIR");

    if env::var_os("CARGO_FEATURE_FFI").is_none() {
        return;
    }

    let ort_dir = env::var("ONNXRUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/local/onnxruntime"));

    let mut build = cc::Build::new();

    build
        .cpp(true)
        .std("c++17")
        .include("csrc")
        .include(ort_dir.join("include"))
        .file("csrc/ort_predictor.cpp")
        .warnings(true)
        .extra_warnings(true);

    if env::var_os("CARGO_FEATURE_CUDA").is_some() {
        build.define("USE_CUDA", "1");
    }

    build.compile("ort_predictor");

    println!("cargo:rustc-link-search=native={}", ort_dir.join("lib").display());
    println!("cargo:rustc-link-lib=dylib=onnxruntime");

    #[cfg(target_os = "linux")]
    {
        println!("cargo:rustc-link-lib=stdc++");
    }
}
