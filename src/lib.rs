pub mod tracing_config;
