//! The Bolt gateway engine: an HTTP-fronted API gateway that fans each call
//! out as a pipeline of commands over an AMQP broker and reassembles the
//! worker replies into a single response payload.

pub mod broker;
pub mod cache;
pub mod config;
pub mod engine;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod rate_limit;
pub mod registry;

/// The 'friendly' name of the product.
pub const ENGINE_NAME: &str = "Bolt Engine";

/// Directory checked for `config.json` unless overridden.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/bolt";
