//! Storage-independent lending rules shared by both repository backends

pub mod availability;
pub mod lifecycle;
pub mod otp;

pub use availability::{Reservation, ResolvedUnit, TypeLedger};
pub use lifecycle::OverrideAction;
pub use otp::OtpPolicy;
