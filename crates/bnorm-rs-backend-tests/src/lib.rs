pub use anyhow;

pub mod common;
pub mod recording_device;
pub mod smoke;

/// Expands the shared conformance suite into a `#[cfg(test)]` module for one device.
///
/// `$device_ctor` is any expression callable with no arguments that returns an `Arc<Device>`.
#[macro_export]
macro_rules! define_device_tests {
    ($module:ident, $device_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            #[allow(unused_imports)]
            use std::sync::Arc;
            use $crate::smoke;

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() -> $crate::anyhow::Result<()> {
                        let device = ($device_ctor)();
                        smoke::$name(&device)
                    }
                };
            }

            smoke_test!(nchw_f32_matches_reference);
            smoke_test!(rank2_defaults_match_reference);
            smoke_test!(half_precision_scale_and_bias_are_cast);
            smoke_test!(f16_end_to_end_matches_reference);
            smoke_test!(fused_relu_clamps_negatives);
            smoke_test!(fused_leaky_relu_uses_custom_alpha);
            smoke_test!(per_activation_statistics_without_spatial);
            smoke_test!(repeated_compute_reuses_kernel);
            smoke_test!(extra_outputs_are_accepted);
            smoke_test!(compute_rejects_wrong_buffer_count);
            smoke_test!(mismatched_statistics_dtype_fails_build);
        }
    };
}
