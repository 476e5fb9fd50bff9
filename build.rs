//! Build script for Picard
//!
//! This script handles:
//! - Linking libsheepdog when the `sheepdog` feature is enabled
//! - Setting up library search paths
//!
//! # Prerequisites
//!
//! ```bash
//! # Build and install the sheepdog client library
//! git clone https://github.com/sheepdog/sheepdog.git
//! cd sheepdog
//! ./autogen.sh
//! ./configure --enable-lib
//! make -j$(nproc)
//! sudo make install
//! sudo ldconfig
//! ```
//!
//! # Environment Variables
//!
//! - `SHEEPDOG_DIR` - Path to the sheepdog installation (default: /usr/local)

use std::env;
use std::path::PathBuf;

fn main() {
    // Only run linking logic when the sheepdog feature is enabled
    if env::var_os("CARGO_FEATURE_SHEEPDOG").is_none() {
        return;
    }

    println!("cargo:rerun-if-env-changed=SHEEPDOG_DIR");

    #[cfg(feature = "pkg-config")]
    {
        if find_with_pkg_config() {
            return;
        }
    }

    let sheepdog_dir = env::var("SHEEPDOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/local"));

    // =========================================================================
    // Library Search Paths
    // =========================================================================

    for lib_dir in ["lib", "lib64"] {
        let path = sheepdog_dir.join(lib_dir);
        if path.exists() {
            println!("cargo:rustc-link-search=native={}", path.display());
        }
    }

    // Standard system paths
    println!("cargo:rustc-link-search=native=/usr/lib");
    println!("cargo:rustc-link-search=native=/usr/lib64");
    println!("cargo:rustc-link-search=native=/usr/local/lib");
    println!("cargo:rustc-link-search=native=/usr/local/lib64");

    // =========================================================================
    // Libraries
    // =========================================================================

    // Sheepdog client library: sd_connect, sd_vdi_*, sd_strerror
    println!("cargo:rustc-link-lib=sheepdog");

    // libsheepdog runs its request queue on a worker thread
    println!("cargo:rustc-link-lib=pthread");

    println!("cargo:warning=SHEEPDOG_DIR: {}", sheepdog_dir.display());
}

/// Use pkg-config to find libsheepdog (more portable).
///
/// Enable with: cargo build --features "sheepdog,pkg-config"
#[cfg(feature = "pkg-config")]
fn find_with_pkg_config() -> bool {
    pkg_config::Config::new().probe("sheepdog").is_ok()
}
