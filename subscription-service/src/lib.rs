//! Subscription lifecycle and billing core for a multi-tenant messaging
//! platform: plans, trials, paid subscriptions, usage metering, proration,
//! renewals and the scheduled sweeps that keep them consistent.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod observability;
pub mod scheduler;
pub mod services;
pub mod startup;

pub use error::{BillingError, Result};
