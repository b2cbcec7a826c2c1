pub fn broker_version() -> &'static str {
    // See build.rs
    env!("CI_BROKER_CI_TAG")
}

pub fn broker_target_triple() -> &'static str {
    // See build.rs
    env!("CI_BROKER_TARGET_TRIPLE")
}
