//! ssl-termination-proxy: reconciling controller for a TLS-terminating reverse proxy
//!
//! Consumer services relate to the proxy by declaring hostnames, backends,
//! a load-balancing mode and optional basic-auth users. The controller
//! keeps one certificate covering every hostname and one nginx site per
//! service, and reports a single status for the whole proxy.

pub mod config;
pub mod controller;
pub mod error;
pub mod proxy;
pub mod relation;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::config::ProxyConfig;
pub use crate::error::{Error, Result};
