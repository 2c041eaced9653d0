//! Pulls Xcel Energy usage out of the customer portal: a scripted Chrome logs
//! in and federates to the usage app, the usage page's own chart requests are
//! captured and replayed over HTTP, and the results land in dated CSV files
//! plus a Prometheus textfile.

pub mod browser;
pub mod config;
pub mod dataset;
pub mod dom;
pub mod error;
pub mod fetch;
pub mod intercept;
pub mod metrics;
pub mod pipeline;
pub mod portal;
pub mod session;
pub mod shadow;
pub mod wait;

#[cfg(test)]
mod fake;
