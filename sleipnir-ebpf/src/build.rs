use std::path::PathBuf;
use std::process::Command;

/// With the `bundle-bpf` feature, compile the BPF kernel programs
/// (`sleipnir-ebpf-xdp`) using `cargo +nightly build` for the
/// `bpfel-unknown-none` target, and stage the ELF for
/// `aya::include_bytes_aligned!` in loader.rs.
///
/// Without the feature this script is a no-op and the datapath object is
/// loaded from a filesystem path at runtime instead.
///
/// Requirements (feature enabled): Rust nightly toolchain with the
/// `rust-src` component. The `rust-toolchain.toml` in `sleipnir-ebpf-xdp/`
/// pins the channel.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("CARGO_FEATURE_BUNDLE_BPF").is_none() {
        return Ok(());
    }

    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR")?);
    let programs_dir = manifest_dir
        .parent()
        .ok_or("could not find workspace root")?
        .join("sleipnir-ebpf-xdp");

    println!("cargo:rerun-if-changed={}", programs_dir.join("src/main.rs").display());
    println!("cargo:rerun-if-changed={}", programs_dir.join("Cargo.toml").display());

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let bpf_target_dir = out_dir.join("bpf-programs-target");

    // Cargo sets RUSTC, RUSTDOC and RUSTUP_TOOLCHAIN for build scripts,
    // pointing at the current (stable) toolchain. The child cargo would
    // inherit them and override the nightly selection from the
    // rust-toolchain.toml in sleipnir-ebpf-xdp/, so strip them.
    let status = Command::new("cargo")
        .args(["build", "--release", "--package", "sleipnir-ebpf-xdp"])
        .env("CARGO_TARGET_DIR", &bpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTDOC")
        .env_remove("RUSTUP_TOOLCHAIN")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .env_remove("RUSTC_WRAPPER")
        .current_dir(&programs_dir)
        .status();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => {
            return Err(format!(
                "cargo build of sleipnir-ebpf-xdp failed (exit {:?}).\n\
                Ensure nightly toolchain and rust-src are installed:\n\
                  rustup toolchain install nightly\n\
                  rustup component add rust-src --toolchain nightly",
                s.code()
            )
            .into());
        }
        Err(e) => {
            return Err(format!("failed to run cargo: {e}").into());
        }
    }

    let bpf_bin = bpf_target_dir.join("bpfel-unknown-none/release/sleipnir-ebpf-xdp");
    if !bpf_bin.exists() {
        return Err(format!("BPF binary not found at {}", bpf_bin.display()).into());
    }

    let out_file = out_dir.join("sleipnir.bpf.o");
    std::fs::copy(&bpf_bin, &out_file)?;
    Ok(())
}
