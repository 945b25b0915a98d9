//! Build script for framepool.
//!
//! Reports which backends and lock implementations are compiled in, and
//! warns about combinations that are unlikely to be intended.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_GPU_VULKAN");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DIAGNOSTICS");

    let vulkan_enabled = env::var("CARGO_FEATURE_GPU_VULKAN").is_ok();
    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();
    let diagnostics_enabled = env::var("CARGO_FEATURE_DIAGNOSTICS").is_ok();

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    // --- Backends ---
    if vulkan_enabled {
        emit_info("Vulkan backend enabled (ash + gpu-allocator)");
        emit_note("Open a device with:");
        emit_note("  let backend = VulkanBackend::new(&instance, physical_device, device, queue_family)?;");
        emit_note("  let device = registry.open(Arc::new(backend), DeviceConfig::default())?;");
        emit_note("Peer access and GL/D3D11 interop report unavailable on this backend;");
        emit_note("cross-device and interop copies take the host staging path.");

        let target = env::var("TARGET").unwrap_or_default();
        if target.contains("wasm") {
            emit_warning("'gpu-vulkan' enabled for a WebAssembly target!");
            emit_note("ash cannot load a Vulkan loader on wasm; disable the feature.");
        }
    }

    // --- Locks ---
    if parking_lot_enabled {
        emit_info("Using parking_lot for pool and memory locks");
    } else if is_release {
        emit_note("Tip: enable 'parking_lot' for cheaper uncontended pool locks:");
        emit_note("  framepool = { version = \"0.1\", features = [\"parking_lot\"] }");
    }

    // --- Diagnostics ---
    if diagnostics_enabled && is_release {
        emit_info("Verbose diagnostics enabled in release build");
        emit_note("note/help lines are logged at info level alongside every diagnostic.");
    }
}

fn emit_info(msg: &str) {
    println!("cargo:warning=[framepool] {}", msg);
}

fn emit_note(msg: &str) {
    if msg.is_empty() {
        println!("cargo:warning=[framepool]");
    } else {
        println!("cargo:warning=[framepool]    {}", msg);
    }
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[framepool] warning: {}", msg);
}
