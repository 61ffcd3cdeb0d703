/// Version string shown by `--version` on every binary.
pub const SEQRUN_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (build ",
    env!("SEQRUN_BUILD_N"),
    ")"
);
