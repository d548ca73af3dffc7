//! Earnify backend: wallet ledger, mobile-money gateway adapters, callback
//! reconciliation, admin approvals and reward tasks.

pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
