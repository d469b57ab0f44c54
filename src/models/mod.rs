//! Data models for the equipment lending server

pub mod borrow;
pub mod equipment;
pub mod otp;
pub mod returns;
pub mod user;

// Re-export commonly used types
pub use borrow::{BorrowRequest, BorrowRequestDetails, BorrowRequestItem, BorrowRequestStatus};
pub use equipment::{Availability, EquipmentType, Unit, UnitStatus};
pub use otp::IssuedOtp;
pub use returns::{ReturnRequest, ReturnRequestDetails, ReturnRequestItem};
pub use user::UserBasicInfo;
