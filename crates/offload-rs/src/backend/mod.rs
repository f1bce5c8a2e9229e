pub mod accelerator;
pub mod builder;
pub mod ir_utils;
pub mod op_support;
pub mod pass_context;
pub mod passes;
pub mod registry;
pub mod spec;
pub mod validate;
