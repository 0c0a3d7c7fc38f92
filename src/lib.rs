//! Payment orchestration backend for a dating app: paid subscriptions,
//! service packages and gifts charged through Robokassa or Unitpay.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
