use offload_rs_harness::{HarnessConfig, HarnessContext};

offload_rs_harness::define_scenario_tests!(vsim, || HarnessContext::vsim(
    HarnessConfig::default()
));
