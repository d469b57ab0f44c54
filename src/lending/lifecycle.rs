//! Borrow request state machine and request-shape checks

use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::borrow::{BorrowItemInput, BorrowRequestStatus};
use crate::models::returns::ReturnItemInput;

/// What an administrative status change has to do besides flipping the status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideAction {
    /// approved -> received: bind units like a claim, without a code
    Allocate,
    /// received -> fulfilled: only once every unit is back
    Fulfil,
    /// approved -> unclaimed: drop the reservation and its code
    Release,
    /// pending -> rejected
    Reject,
}

fn invalid_transition(from: BorrowRequestStatus, to: BorrowRequestStatus) -> AppError {
    AppError::InvalidBorrowRequestStatus(format!("cannot move from {} to {}", from, to))
}

fn require(current: BorrowRequestStatus, expected: BorrowRequestStatus) -> AppResult<()> {
    if current == expected {
        Ok(())
    } else {
        Err(AppError::InvalidBorrowRequestStatus(format!(
            "request is {}, expected {}",
            current, expected
        )))
    }
}

/// Only pending requests are reviewed
pub fn check_reviewable(current: BorrowRequestStatus) -> AppResult<()> {
    require(current, BorrowRequestStatus::Pending)
}

/// Only approved requests are claimed
pub fn check_claimable(current: BorrowRequestStatus) -> AppResult<()> {
    require(current, BorrowRequestStatus::Approved)
}

/// Units can only be handed back for requests that received them
pub fn check_returnable(current: BorrowRequestStatus) -> AppResult<()> {
    require(current, BorrowRequestStatus::Received)
}

pub fn check_override(
    current: BorrowRequestStatus,
    target: BorrowRequestStatus,
) -> AppResult<OverrideAction> {
    use BorrowRequestStatus::*;

    match (current, target) {
        (Approved, Received) => Ok(OverrideAction::Allocate),
        (Received, Fulfilled) => Ok(OverrideAction::Fulfil),
        (Approved, Unclaimed) => Ok(OverrideAction::Release),
        (Pending, Rejected) => Ok(OverrideAction::Reject),
        _ => Err(invalid_transition(current, target)),
    }
}

fn positive(quantity: i32) -> AppResult<u32> {
    if quantity <= 0 {
        return Err(AppError::Validation(format!(
            "invalid quantity {}, must be positive",
            quantity
        )));
    }
    Ok(quantity as u32)
}

/// Merge repeated ids, keeping first-seen order
fn merge(pairs: impl Iterator<Item = AppResult<(Uuid, u32)>>, what: &str) -> AppResult<Vec<(Uuid, u32)>> {
    let mut merged: Vec<(Uuid, u32)> = Vec::new();
    for pair in pairs {
        let (id, quantity) = pair?;
        match merged.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, total)) => {
                *total = total
                    .checked_add(quantity)
                    .filter(|sum| *sum <= i32::MAX as u32)
                    .ok_or_else(|| {
                        AppError::Validation(format!("total quantity for {} {} is too large", what, id))
                    })?;
            }
            None => merged.push((id, quantity)),
        }
    }
    if merged.is_empty() {
        return Err(AppError::Validation(format!("at least one {} is required", what)));
    }
    Ok(merged)
}

/// Requested lines as (equipment type, quantity)
pub fn normalize_borrow_items(items: &[BorrowItemInput]) -> AppResult<Vec<(Uuid, u32)>> {
    merge(
        items
            .iter()
            .map(|i| positive(i.quantity).map(|q| (i.equipment_type_id, q))),
        "equipment item",
    )
}

/// Returned lines as (borrow request item, quantity)
pub fn normalize_return_items(items: &[ReturnItemInput]) -> AppResult<Vec<(Uuid, u32)>> {
    merge(
        items
            .iter()
            .map(|i| positive(i.quantity).map(|q| (i.borrow_request_item_id, q))),
        "return item",
    )
}

/// Ceilings for returning `requested` units of a borrowed line.
///
/// `already_returned` counts lines of confirmed return requests; `open` is the
/// live count of unreturned borrow transactions.
pub fn check_return_quantity(
    borrowed: u32,
    already_returned: u32,
    open: u32,
    requested: u32,
) -> AppResult<()> {
    if open == 0 {
        return Err(AppError::ItemFullyReturned);
    }
    if already_returned + requested > borrowed || requested > open {
        return Err(AppError::ExceedsRemainingQuantity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use BorrowRequestStatus::*;

    #[test]
    fn override_table() {
        assert_eq!(check_override(Approved, Received).unwrap(), OverrideAction::Allocate);
        assert_eq!(check_override(Received, Fulfilled).unwrap(), OverrideAction::Fulfil);
        assert_eq!(check_override(Approved, Unclaimed).unwrap(), OverrideAction::Release);
        assert_eq!(check_override(Pending, Rejected).unwrap(), OverrideAction::Reject);

        for (from, to) in [
            (Pending, Approved),
            (Pending, Received),
            (Received, Approved),
            (Fulfilled, Received),
            (Rejected, Pending),
            (Unclaimed, Approved),
        ] {
            assert!(matches!(
                check_override(from, to),
                Err(AppError::InvalidBorrowRequestStatus(_))
            ));
        }
    }

    #[test]
    fn review_and_claim_require_their_state() {
        assert!(check_reviewable(Pending).is_ok());
        assert!(check_reviewable(Approved).is_err());
        assert!(check_claimable(Approved).is_ok());
        assert!(check_claimable(Unclaimed).is_err());
        assert!(check_returnable(Received).is_ok());
        assert!(check_returnable(Fulfilled).is_err());
    }

    #[test]
    fn borrow_items_reject_empty_and_non_positive() {
        assert!(matches!(normalize_borrow_items(&[]), Err(AppError::Validation(_))));

        let bad = [BorrowItemInput {
            equipment_type_id: Uuid::new_v4(),
            quantity: 0,
        }];
        assert!(matches!(normalize_borrow_items(&bad), Err(AppError::Validation(_))));
    }

    #[test]
    fn repeated_types_are_merged() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let items = [
            BorrowItemInput { equipment_type_id: a, quantity: 1 },
            BorrowItemInput { equipment_type_id: b, quantity: 2 },
            BorrowItemInput { equipment_type_id: a, quantity: 3 },
        ];
        assert_eq!(normalize_borrow_items(&items).unwrap(), vec![(a, 4), (b, 2)]);
    }

    #[test]
    fn merged_totals_must_fit_a_quantity_column() {
        let a = Uuid::new_v4();
        let items = [
            BorrowItemInput { equipment_type_id: a, quantity: i32::MAX },
            BorrowItemInput { equipment_type_id: a, quantity: i32::MAX },
            BorrowItemInput { equipment_type_id: a, quantity: 2 },
        ];
        assert!(matches!(normalize_borrow_items(&items), Err(AppError::Validation(_))));

        let just_over = [
            BorrowItemInput { equipment_type_id: a, quantity: i32::MAX },
            BorrowItemInput { equipment_type_id: a, quantity: 1 },
        ];
        assert!(matches!(normalize_borrow_items(&just_over), Err(AppError::Validation(_))));

        let line = Uuid::new_v4();
        let returns = [
            ReturnItemInput { borrow_request_item_id: line, quantity: i32::MAX },
            ReturnItemInput { borrow_request_item_id: line, quantity: i32::MAX },
        ];
        assert!(matches!(normalize_return_items(&returns), Err(AppError::Validation(_))));
    }

    #[test]
    fn return_ceilings() {
        assert!(check_return_quantity(2, 0, 2, 2).is_ok());
        assert!(matches!(check_return_quantity(2, 2, 0, 1), Err(AppError::ItemFullyReturned)));
        assert!(matches!(
            check_return_quantity(3, 1, 2, 3),
            Err(AppError::ExceedsRemainingQuantity)
        ));
        assert!(matches!(
            check_return_quantity(3, 0, 1, 2),
            Err(AppError::ExceedsRemainingQuantity)
        ));
    }
}
