use std::env;

fn main() {
    // Models are loaded at runtime; only report what the default paths hold
    let background_path = "models/u2net.onnx";
    let classifier_path = "models/landmark.onnx";

    println!("cargo:rerun-if-changed={}", background_path);
    println!("cargo:rerun-if-changed={}", classifier_path);
    println!("cargo:rerun-if-changed=build.rs");

    for (name, path) in [("background", background_path), ("classifier", classifier_path)] {
        match std::fs::metadata(path) {
            Ok(meta) => println!(
                "cargo:warning=Found {} model {} ({:.1} MB)",
                name,
                path,
                meta.len() as f64 / 1_048_576.0
            ),
            Err(_) => println!(
                "cargo:warning={} model not found at {} (the feature stays disabled unless configured elsewhere)",
                name, path
            ),
        }
    }

    // Detect enabled acceleration features
    let mut enabled_features = Vec::new();

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        enabled_features.push("CUDA");
    }
    if env::var("CARGO_FEATURE_TENSORRT").is_ok() {
        enabled_features.push("TensorRT");
    }
    if env::var("CARGO_FEATURE_DIRECTML").is_ok() {
        enabled_features.push("DirectML");
    }
    if env::var("CARGO_FEATURE_COREML").is_ok() {
        enabled_features.push("CoreML");
    }
    if env::var("CARGO_FEATURE_OPENVINO").is_ok() {
        enabled_features.push("OpenVINO");
    }

    if enabled_features.is_empty() {
        println!("cargo:warning=Building with CPU-only inference (no GPU acceleration)");
    } else {
        println!("cargo:warning=GPU acceleration enabled: {}", enabled_features.join(", "));
    }

    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("windows-gnu") && enabled_features.contains(&"CUDA") {
        println!("cargo:warning=CUDA binaries may not be available for Windows GNU target");
    }
}
