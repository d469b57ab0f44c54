//! Equipment lending server
//!
//! Reservation, claim and return engine for a shared pool of equipment:
//! borrowers request quantities of an equipment type, reviewers approve
//! them, borrowers claim units with a one-time code, and returns are
//! confirmed per unit. Unit status is never stored; it is derived from
//! borrow transactions and approved requests.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod error;
pub mod lending;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
    pub repository: repository::Repository,
}
