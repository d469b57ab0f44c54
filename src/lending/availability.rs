//! Availability resolver
//!
//! Unit status is never stored. It is derived from three facts about a type:
//! its units, the open borrow transactions binding some of them, and the
//! quantities held by `approved` requests. Both storage backends load a
//! [`TypeLedger`] snapshot inside their transaction and ask it the questions
//! below, so the reported status and the later allocation agree.

use std::collections::HashMap;

use uuid::Uuid;

use crate::models::equipment::{Availability, Unit, UnitHolder, UnitStatus};

/// Capacity soft-held by one approved request for one type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub borrow_request_id: Uuid,
    pub user_id: Uuid,
    pub quantity: u32,
}

/// A unit with its resolved status
#[derive(Debug, Clone)]
pub struct ResolvedUnit {
    pub unit: Unit,
    pub status: UnitStatus,
    pub holder: Option<UnitHolder>,
}

/// Snapshot of one equipment type
#[derive(Debug, Clone)]
pub struct TypeLedger {
    equipment_type_id: Uuid,
    /// Sorted by unit id; this order picks the reserved units and the claimed ones
    units: Vec<Unit>,
    borrowed: HashMap<Uuid, UnitHolder>,
    /// In approval order
    reservations: Vec<Reservation>,
}

impl TypeLedger {
    pub fn new(
        equipment_type_id: Uuid,
        mut units: Vec<Unit>,
        borrowed: HashMap<Uuid, UnitHolder>,
        reservations: Vec<Reservation>,
    ) -> Self {
        units.sort_by_key(|u| u.id);
        Self {
            equipment_type_id,
            units,
            borrowed,
            reservations,
        }
    }

    pub fn equipment_type_id(&self) -> Uuid {
        self.equipment_type_id
    }

    pub fn total(&self) -> u32 {
        self.units.len() as u32
    }

    pub fn borrowed(&self) -> u32 {
        self.units
            .iter()
            .filter(|u| self.borrowed.contains_key(&u.id))
            .count() as u32
    }

    /// Sum of quantities across approved lines for this type
    pub fn reserved_quantity(&self) -> u32 {
        self.reservations.iter().map(|r| r.quantity).sum()
    }

    /// Units neither borrowed nor reserved
    pub fn truly_available(&self) -> u32 {
        self.availability().available
    }

    pub fn availability(&self) -> Availability {
        let total = self.total();
        let borrowed = self.borrowed();
        let reserved = self.reserved_quantity().min(total - borrowed);
        Availability {
            equipment_type_id: self.equipment_type_id,
            total,
            available: total - borrowed - reserved,
            reserved,
            borrowed,
        }
    }

    /// Whether approving `quantity` more keeps reservations within unborrowed stock
    pub fn can_reserve(&self, quantity: u32) -> bool {
        self.reserved_quantity() + quantity <= self.total() - self.borrowed()
    }

    /// First `quantity` unborrowed units in id order, or `None` when there are too few
    pub fn select_for_claim(&self, quantity: u32) -> Option<Vec<Uuid>> {
        let picked: Vec<Uuid> = self
            .units
            .iter()
            .filter(|u| !self.borrowed.contains_key(&u.id))
            .take(quantity as usize)
            .map(|u| u.id)
            .collect();
        (picked.len() == quantity as usize).then_some(picked)
    }

    /// Status of every unit. The first K unborrowed units (K = reserved quantity)
    /// are reserved, handed out to reservations in approval order.
    pub fn resolve(&self) -> Vec<ResolvedUnit> {
        let mut reservations = self.reservations.iter();
        let mut current = reservations.next();
        let mut used = 0u32;

        self.units
            .iter()
            .map(|unit| {
                if let Some(holder) = self.borrowed.get(&unit.id) {
                    return ResolvedUnit {
                        unit: unit.clone(),
                        status: UnitStatus::Borrowed,
                        holder: Some(*holder),
                    };
                }

                while let Some(r) = current {
                    if used < r.quantity {
                        break;
                    }
                    current = reservations.next();
                    used = 0;
                }

                match current {
                    Some(r) => {
                        used += 1;
                        ResolvedUnit {
                            unit: unit.clone(),
                            status: UnitStatus::Reserved,
                            holder: Some(UnitHolder {
                                user_id: r.user_id,
                                borrow_request_id: r.borrow_request_id,
                            }),
                        }
                    }
                    None => ResolvedUnit {
                        unit: unit.clone(),
                        status: UnitStatus::Available,
                        holder: None,
                    },
                }
            })
            .collect()
    }

    pub fn resolve_unit(&self, unit_id: Uuid) -> Option<ResolvedUnit> {
        self.resolve().into_iter().find(|r| r.unit.id == unit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn units(type_id: Uuid, n: usize) -> Vec<Unit> {
        (0..n)
            .map(|_| Unit {
                id: Uuid::new_v4(),
                equipment_type_id: type_id,
                acquired_at: Utc::now(),
            })
            .collect()
    }

    fn holder() -> UnitHolder {
        UnitHolder {
            user_id: Uuid::new_v4(),
            borrow_request_id: Uuid::new_v4(),
        }
    }

    fn reservation(quantity: u32) -> Reservation {
        Reservation {
            borrow_request_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            quantity,
        }
    }

    #[test]
    fn counts_are_conserved() {
        let type_id = Uuid::new_v4();
        let mut all = units(type_id, 5);
        all.sort_by_key(|u| u.id);
        let borrowed = HashMap::from([(all[4].id, holder())]);
        let ledger = TypeLedger::new(type_id, all, borrowed, vec![reservation(2)]);

        let a = ledger.availability();
        assert_eq!(a.total, 5);
        assert_eq!(a.borrowed, 1);
        assert_eq!(a.reserved, 2);
        assert_eq!(a.available, 2);
        assert_eq!(a.available + a.reserved + a.borrowed, a.total);
    }

    #[test]
    fn reserved_units_are_the_lowest_unborrowed_ids() {
        let type_id = Uuid::new_v4();
        let mut all = units(type_id, 4);
        all.sort_by_key(|u| u.id);
        let borrowed = HashMap::from([(all[0].id, holder())]);
        let first = reservation(1);
        let second = reservation(1);
        let ledger = TypeLedger::new(type_id, all.clone(), borrowed, vec![first, second]);

        let resolved = ledger.resolve();
        assert_eq!(resolved[0].status, UnitStatus::Borrowed);
        assert_eq!(resolved[1].status, UnitStatus::Reserved);
        assert_eq!(resolved[1].holder.unwrap().borrow_request_id, first.borrow_request_id);
        assert_eq!(resolved[2].status, UnitStatus::Reserved);
        assert_eq!(resolved[2].holder.unwrap().borrow_request_id, second.borrow_request_id);
        assert_eq!(resolved[3].status, UnitStatus::Available);

        // claim selection walks the same order
        assert_eq!(ledger.select_for_claim(2), Some(vec![all[1].id, all[2].id]));
    }

    #[test]
    fn reservations_cannot_exceed_unborrowed_stock() {
        let type_id = Uuid::new_v4();
        let ledger = TypeLedger::new(type_id, units(type_id, 4), HashMap::new(), vec![reservation(3)]);

        assert!(ledger.can_reserve(1));
        assert!(!ledger.can_reserve(2));
        assert_eq!(ledger.truly_available(), 1);
    }

    #[test]
    fn claim_selection_fails_when_short() {
        let type_id = Uuid::new_v4();
        let mut all = units(type_id, 2);
        all.sort_by_key(|u| u.id);
        let borrowed = HashMap::from([(all[0].id, holder())]);
        let ledger = TypeLedger::new(type_id, all, borrowed, Vec::new());

        assert!(ledger.select_for_claim(2).is_none());
        assert_eq!(ledger.select_for_claim(1).map(|v| v.len()), Some(1));
    }

    #[test]
    fn zero_quantity_reservations_are_skipped() {
        let type_id = Uuid::new_v4();
        let tail = reservation(1);
        let ledger = TypeLedger::new(
            type_id,
            units(type_id, 2),
            HashMap::new(),
            vec![reservation(0), tail],
        );

        let resolved = ledger.resolve();
        assert_eq!(resolved[0].holder.unwrap().borrow_request_id, tail.borrow_request_id);
        assert_eq!(resolved[1].status, UnitStatus::Available);
    }
}
