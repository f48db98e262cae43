//! Document gateway integration.

pub mod client;

pub use client::{
    resolve_error_from_response, run_error_from_response, GatewayClient, GatewayError,
};
