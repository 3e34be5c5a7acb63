//! Metering Service - Tiered usage metering, rate limiting, and overage
//! billing for multi-tenant API access.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
