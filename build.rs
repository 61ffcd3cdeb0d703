use std::time::{SystemTime, UNIX_EPOCH};

fn emit_build_version() {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=SEQRUN_BUILD_N={n}");
    println!("cargo:rerun-if-changed=build.rs");
}

fn main() {
    emit_build_version();
}
