// build.rs
//
// Bakes a per-build seed into OUT_DIR/build_seed.rs. The opcode assignment
// table and the build entropy stream are derived from it, so every
// compilation gets a different instruction encoding.
//
// Set SHROUD_BUILD_SEED (decimal or 0x-prefixed hex) for reproducible builds.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn main() {
    let seed = match env::var("SHROUD_BUILD_SEED") {
        Ok(raw) => parse_seed(&raw).unwrap_or_else(|| {
            println!("cargo:warning=SHROUD_BUILD_SEED is not a valid u64, using a random seed");
            generate_random_seed()
        }),
        Err(_) => generate_random_seed(),
    };

    let out_dir = env::var_os("OUT_DIR").expect("cargo sets OUT_DIR for build scripts");
    let dest_path = Path::new(&out_dir).join("build_seed.rs");
    let mut f = File::create(&dest_path).expect("create build_seed.rs");
    writeln!(f, "0x{:016X}u64", seed).expect("write build_seed.rs");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SHROUD_BUILD_SEED");
}

fn parse_seed(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Pseudo-random seed from the build environment: wall clock, working
/// directory, profile and manifest path.
fn generate_random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut seed = (now as u64) ^ ((now >> 64) as u64);
    seed ^= u64::from(std::process::id()) << 32;

    if let Ok(pwd) = env::current_dir() {
        let h = pwd.to_string_lossy().bytes().fold(0u64, |acc, b| {
            acc.rotate_left(7).wrapping_add(b as u64)
        });
        seed ^= h;
    }

    if let Ok(profile) = env::var("PROFILE") {
        seed ^= profile.bytes().fold(0u64, |acc, b| acc.wrapping_add(b as u64)) << 48;
    }

    if let Ok(manifest) = env::var("CARGO_MANIFEST_DIR") {
        let h = manifest.bytes().fold(0u64, |acc, b| acc.rotate_right(5) ^ (b as u64));
        seed ^= h.rotate_left(17);
    }

    // splitmix64 finalizer
    seed = (seed ^ (seed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    seed = (seed ^ (seed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    seed ^= seed >> 31;

    if seed == 0 {
        seed = 0x9A3F_C5D7_1E2B_4C6D;
    }
    seed
}
