//! API handlers for the equipment lending REST endpoints
//!
//! Requester and reviewer ids travel in request bodies; authentication is
//! handled in front of this service.

pub mod borrow;
pub mod equipment;
pub mod health;
pub mod openapi;
pub mod returns;
