use bnorm_rs::backend::spec::{ExecutionFlags, ExecutionPreference};

// Flags are read once per process, so this binary holds a single test.
#[test]
fn default_flags_follow_the_environment() {
    std::env::set_var("BNORM_EXECUTION_PREFERENCE", "memory");
    std::env::set_var("BNORM_ALLOW_HALF_PRECISION", "1");

    let flags = ExecutionFlags::default();
    assert_eq!(flags.preference, ExecutionPreference::ConserveMemory);
    assert!(flags.allow_half_precision_computation);
    assert_eq!(flags, ExecutionFlags::from_env());

    std::env::set_var("BNORM_EXECUTION_PREFERENCE", "performance");
    assert_eq!(
        ExecutionFlags::default().preference,
        ExecutionPreference::ConserveMemory
    );
}
