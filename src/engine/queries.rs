use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{classify, Availability};
use super::conflict::today;
use super::{Engine, EngineError};

/// Filter for reservation listings. `from`/`to` select reservations whose
/// period overlaps the given range (either bound may be open).
#[derive(Debug, Clone, Default)]
pub struct ReservationFilter {
    pub status: Option<ReservationStatus>,
    pub resource_id: Option<Ulid>,
    pub tenant_id: Option<Ulid>,
    pub from: Option<Day>,
    pub to: Option<Day>,
    /// Zero-based page index.
    pub page: usize,
    /// Page size; clamped to `MAX_PAGE_SIZE`, 0 means the default of 50.
    pub per_page: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// A resource with its availability projection attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAvailability {
    pub resource: ResourceInfo,
    pub availability: Availability,
}

impl ReservationFilter {
    fn matches(&self, r: &Reservation) -> bool {
        if let Some(status) = self.status
            && r.status != status {
                return false;
            }
        if let Some(rid) = self.resource_id
            && r.resource.id != rid {
                return false;
            }
        if let Some(tid) = self.tenant_id
            && r.resource.tenant_id != tid {
                return false;
            }
        if let Some(from) = self.from
            && r.period.dropoff < from {
                return false;
            }
        if let Some(to) = self.to
            && r.period.pickup > to {
                return false;
            }
        true
    }
}

impl Engine {
    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    pub fn find_reservation_by_intent(&self, intent_id: &str) -> Option<Reservation> {
        let id = self.by_intent.get(intent_id).map(|e| *e.value())?;
        self.get_reservation(&id)
    }

    /// List reservations newest-first, filtered and paginated.
    pub fn list_reservations(&self, filter: &ReservationFilter) -> Result<Page<Reservation>, EngineError> {
        if filter.per_page > MAX_PAGE_SIZE {
            return Err(EngineError::LimitExceeded("page size too large"));
        }
        let per_page = if filter.per_page == 0 { 50 } else { filter.per_page };

        let mut matched: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matched.len();
        let items = matched
            .into_iter()
            .skip(filter.page * per_page)
            .take(per_page)
            .collect();
        Ok(Page {
            items,
            total,
            page: filter.page,
            per_page,
        })
    }

    /// One resource with its availability classification, computed from the
    /// cached windows merged with the ledger (ledger wins). Recomputed per
    /// read, never stored.
    pub async fn resource_availability(
        &self,
        resource_id: Ulid,
    ) -> Result<ResourceAvailability, EngineError> {
        self.resource_availability_at(resource_id, today()).await
    }

    pub async fn resource_availability_at(
        &self,
        resource_id: Ulid,
        day: Day,
    ) -> Result<ResourceAvailability, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let ledger = self.ledger_windows(resource_id);
        Ok(ResourceAvailability {
            resource: guard.info(),
            availability: classify(&guard.windows, &ledger, day),
        })
    }

    /// Batched projection across the whole fleet (optionally one tenant's),
    /// a single pass over the ledger instead of one scan per resource.
    pub async fn fleet_availability(
        &self,
        tenant_id: Option<Ulid>,
    ) -> Vec<ResourceAvailability> {
        self.fleet_availability_at(tenant_id, today()).await
    }

    pub async fn fleet_availability_at(
        &self,
        tenant_id: Option<Ulid>,
        day: Day,
    ) -> Vec<ResourceAvailability> {
        // Group the ledger by resource in one sweep.
        let mut by_resource: std::collections::HashMap<Ulid, Vec<BookingWindow>> =
            std::collections::HashMap::new();
        for r in self.reservations.iter() {
            if r.status.is_blocking() {
                by_resource.entry(r.resource.id).or_default().push(r.window());
            }
        }

        let shared: Vec<super::SharedResource> = self
            .resources
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            let guard = rs.read().await;
            if let Some(tid) = tenant_id
                && guard.tenant_id != tid {
                    continue;
                }
            let ledger = by_resource.remove(&guard.id).unwrap_or_default();
            out.push(ResourceAvailability {
                resource: guard.info(),
                availability: classify(&guard.windows, &ledger, day),
            });
        }
        out.sort_by(|a, b| a.resource.name.cmp(&b.resource.name).then(a.resource.id.cmp(&b.resource.id)));
        out
    }
}
