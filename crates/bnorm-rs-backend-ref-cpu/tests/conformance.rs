use std::sync::Arc;

use bnorm_rs_backend_ref_cpu::CpuDevice;

bnorm_rs_backend_tests::define_device_tests!(cpu, || Arc::new(CpuDevice::new()));
