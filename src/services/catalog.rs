//! Equipment catalog service

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use super::{clock::Clock, events, events::EventBus};
use crate::{
    error::{AppError, AppResult},
    models::equipment::{
        Availability, CreateEquipment, CreatedEquipment, EquipmentQuery, EquipmentSummary,
        EquipmentType, UnitStatus, UnitStatusDetails, UpdateEquipment,
    },
    repository::Repository,
};

#[derive(Clone)]
pub struct CatalogService {
    repository: Repository,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl CatalogService {
    pub fn new(repository: Repository, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            events,
            clock,
        }
    }

    /// Acquire stock. An existing type (same name, brand and model) keeps its id
    /// and gets the new image; the units are always added.
    pub async fn create_equipment(&self, input: CreateEquipment) -> AppResult<CreatedEquipment> {
        input.validate()?;
        let input = input.normalized();

        let created = self
            .repository
            .catalog
            .create_equipment(&input, self.clock.now())
            .await?;

        tracing::info!(
            equipment_type_id = %created.equipment_type.id,
            quantity = created.quantity,
            "Equipment acquired"
        );
        self.events.emit(events::EQUIPMENT_CREATE, &created).await;
        Ok(created)
    }

    /// Units grouped per type, status and holder
    pub async fn list_equipment(&self, query: &EquipmentQuery) -> AppResult<Vec<EquipmentSummary>> {
        let names = query.names();
        let search = query.search();

        let mut groups: Vec<(EquipmentType, UnitStatus, Option<Uuid>, u32)> = Vec::new();
        for (equipment_type, ledger) in self.repository.catalog.ledgers().await? {
            if !names.is_empty() && !names.contains(&equipment_type.name) {
                continue;
            }
            if search.is_some_and(|s| !equipment_type.matches_search(s)) {
                continue;
            }

            let mut counts: BTreeMap<(UnitStatus, Option<Uuid>), u32> = BTreeMap::new();
            for unit in ledger.resolve() {
                if query.status.is_some_and(|s| s != unit.status) {
                    continue;
                }
                *counts
                    .entry((unit.status, unit.holder.map(|h| h.user_id)))
                    .or_default() += 1;
            }

            for ((status, holder), quantity) in counts {
                groups.push((equipment_type.clone(), status, holder, quantity));
            }
        }

        let holder_ids: Vec<Uuid> = groups.iter().filter_map(|(_, _, h, _)| *h).collect();
        let users = self.repository.users.basic_info_many(&holder_ids).await?;

        Ok(groups
            .into_iter()
            .map(|(t, status, holder, quantity)| EquipmentSummary {
                id: t.id,
                name: t.name,
                brand: t.brand,
                model: t.model,
                image_url: t.image_url,
                status,
                quantity,
                holder: holder.and_then(|id| users.get(&id).cloned()),
            })
            .collect())
    }

    pub async fn equipment_names(&self) -> AppResult<Vec<String>> {
        self.repository.catalog.equipment_names().await
    }

    pub async fn get_equipment_type(&self, id: Uuid) -> AppResult<EquipmentType> {
        self.repository.catalog.get_type(id).await
    }

    pub async fn update_equipment_type(&self, id: Uuid, changes: UpdateEquipment) -> AppResult<EquipmentType> {
        changes.validate()?;
        let trimmed = |v: Option<String>| v.map(|s| s.trim().to_string());
        let changes = UpdateEquipment {
            name: trimmed(changes.name),
            brand: trimmed(changes.brand),
            model: trimmed(changes.model),
            image_url: changes.image_url,
        };

        let updated = self.repository.catalog.update_type(id, &changes).await?;
        tracing::info!(equipment_type_id = %id, "Equipment type updated");
        self.events.emit(events::EQUIPMENT_UPDATE, &updated).await;
        Ok(updated)
    }

    /// Total, available, reserved and borrowed counts for one type
    pub async fn type_availability(&self, type_id: Uuid) -> AppResult<Availability> {
        Ok(self.repository.catalog.ledger(type_id).await?.availability())
    }

    /// Status of one unit and who holds or reserves it
    pub async fn unit_status(&self, unit_id: Uuid) -> AppResult<UnitStatusDetails> {
        let unit = self.repository.catalog.get_unit(unit_id).await?;
        let ledger = self.repository.catalog.ledger(unit.equipment_type_id).await?;
        let resolved = ledger
            .resolve_unit(unit_id)
            .ok_or_else(|| AppError::NotFound(format!("Equipment unit {} not found", unit_id)))?;

        let holder = match resolved.holder {
            Some(h) => Some(self.repository.users.basic_info(h.user_id).await?),
            None => None,
        };

        Ok(UnitStatusDetails {
            unit: resolved.unit,
            status: resolved.status,
            borrow_request_id: resolved.holder.map(|h| h.borrow_request_id),
            holder,
        })
    }
}
