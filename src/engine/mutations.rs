use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{admit, find_blocking_overlap, today, validate_period};
use super::{Engine, EngineError};

/// Ingestion point for the resource-management collaborator.
#[derive(Debug, Clone)]
pub struct RegisterResource {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: String,
    pub daily_rate: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct CreateReservation {
    pub resource: ResourceRef,
    /// Caller identity from the identity collaborator; `None` selects the
    /// guest flow (provision/find by email).
    pub customer_id: Option<Ulid>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub pickup: Day,
    pub dropoff: Day,
    /// Total in minor units; currency is taken from the canonical resource.
    pub amount: i64,
    pub details: Option<Value>,
    pub address: Option<Value>,
}

/// Field-wise update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ReservationPatch {
    pub resource: Option<ResourceRef>,
    pub pickup: Option<Day>,
    pub dropoff: Option<Day>,
    pub amount: Option<i64>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub details: Option<Value>,
    pub address: Option<Value>,
}

/// Tenant scoping for mutations: `unscoped()` is the trusted/admin path;
/// a scoped call on another tenant's reservation is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantScope(Option<Ulid>);

impl TenantScope {
    pub fn unscoped() -> Self {
        Self(None)
    }

    pub fn tenant(id: Ulid) -> Self {
        Self(Some(id))
    }

    fn check(&self, owner: Ulid) -> Result<(), EngineError> {
        match self.0 {
            Some(scope) if scope != owner => Err(EngineError::Authorization { tenant_id: owner }),
            _ => Ok(()),
        }
    }
}

/// Outcome of the idempotent payment-confirmation transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    Applied(Reservation),
    /// A confirmation already landed; state untouched, first id kept.
    AlreadyApplied(Reservation),
}

fn validate_contact(name: &str, email: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("customer_name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("customer name too long"));
    }
    if !email.contains('@') || email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::validation("customer_email", "not a valid email address"));
    }
    Ok(())
}

fn validate_opaque(field: &'static str, value: &Option<Value>) -> Result<(), EngineError> {
    if let Some(v) = value {
        let bytes = serde_json::to_vec(v).map(|b| b.len()).unwrap_or(usize::MAX);
        if bytes > MAX_OPAQUE_PAYLOAD_BYTES {
            return Err(EngineError::validation(field, "payload too large"));
        }
    }
    Ok(())
}

impl Engine {
    // ── Resource directory (collaborator-facing) ─────────────────

    pub async fn register_resource(
        &self,
        input: RegisterResource,
    ) -> Result<(), EngineError> {
        if input.name.is_empty() || input.name.len() > MAX_NAME_LEN {
            return Err(EngineError::validation("name", "must be 1..=256 characters"));
        }
        if input.currency.is_empty() || input.currency.len() > MAX_CURRENCY_LEN {
            return Err(EngineError::validation("currency", "not a currency code"));
        }
        if input.daily_rate < 0 {
            return Err(EngineError::validation("daily_rate", "must not be negative"));
        }
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.resources.contains_key(&input.id) {
            return Err(EngineError::AlreadyExists(input.id));
        }

        let event = Event::ResourceRegistered {
            id: input.id,
            tenant_id: input.tenant_id,
            name: input.name.clone(),
            daily_rate: input.daily_rate,
            currency: input.currency.clone(),
            status: ResourceStatus::Available,
        };
        self.wal_append(vec![event.clone()]).await?;

        let rs = ResourceState::new(
            input.id,
            input.tenant_id,
            input.name,
            input.daily_rate,
            input.currency,
        );
        self.resources
            .insert(input.id, Arc::new(tokio::sync::RwLock::new(rs)));
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(self.resources.len() as f64);
        self.notify.send(input.id, &event);
        self.maybe_compact();
        Ok(())
    }

    /// Manual status override (maintenance on/off). Derived occupancy is
    /// re-applied immediately, so clearing maintenance lands on the correct
    /// available/rented state.
    pub async fn set_resource_status(
        &self,
        id: Ulid,
        status: ResourceStatus,
    ) -> Result<ResourceStatus, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write_owned().await;

        let event = Event::ResourceStatusSet { id, status };
        self.wal_append(vec![event.clone()]).await?;
        guard.status = status;
        self.resync_resource(&mut guard, today());
        let effective = guard.status;
        self.notify.send(id, &event);
        self.maybe_compact();
        Ok(effective)
    }

    // ── Reservation lifecycle ────────────────────────────────────

    pub async fn create_reservation(
        &self,
        input: CreateReservation,
    ) -> Result<Reservation, EngineError> {
        let start = Instant::now();

        validate_contact(&input.customer_name, &input.customer_email)?;
        if input.amount < 0 {
            return Err(EngineError::validation("amount", "must not be negative"));
        }
        validate_opaque("details", &input.details)?;
        validate_opaque("address", &input.address)?;
        let period = Period {
            pickup: input.pickup,
            dropoff: input.dropoff,
        };
        validate_period(&period)?;

        // Boundary normalization: either ref shape collapses to the id; any
        // embedded tenant/pricing is discarded in favor of the canonical
        // record below.
        let resource_id = input.resource.resource_id();
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.clone().write_owned().await;
        if guard.windows.len() >= MAX_WINDOWS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many windows on resource"));
        }

        let customer = match input.customer_id {
            Some(id) => CustomerSnapshot {
                id,
                name: input.customer_name.clone(),
                email: input.customer_email.clone(),
                phone: input.customer_phone.clone(),
                guest: false,
            },
            None => self
                .guests
                .find_or_provision(
                    &input.customer_name,
                    &input.customer_email,
                    input.customer_phone.as_deref(),
                )
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::InvalidInput => {
                        EngineError::validation("customer_email", e.to_string())
                    }
                    _ => EngineError::LimitExceeded("too many guest identities"),
                })?,
        };

        let record = Reservation {
            id: Ulid::new(),
            customer,
            resource: guard.snapshot(), // canonical attributes, never the caller's
            period,
            created_at: Utc::now(),
            status: ReservationStatus::Pending,
            amount: input.amount,
            currency: guard.currency.clone(),
            payment: PaymentState::unpaid(),
            details: input.details,
            address: input.address,
        };

        // Conflict guard: scan + append under this write lock.
        admit(&mut guard, record.window(), None)?;

        if let Err(e) = self.wal_append(vec![Event::ReservationCreated {
            record: Box::new(record.clone()),
        }])
        .await
        {
            guard.remove_window(record.id); // roll back the staged entry
            return Err(e);
        }

        self.reservations.insert(record.id, record.clone());
        self.resync_resource(&mut guard, today());
        self.notify.send(
            resource_id,
            &Event::ReservationCreated {
                record: Box::new(record.clone()),
            },
        );
        metrics::counter!(crate::observability::MUTATIONS_TOTAL, "op" => "create").increment(1);
        metrics::histogram!(crate::observability::TXN_DURATION_SECONDS, "op" => "create")
            .record(start.elapsed().as_secs_f64());
        self.maybe_compact();
        Ok(record)
    }

    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        scope: TenantScope,
    ) -> Result<Reservation, EngineError> {
        let start = Instant::now();

        validate_opaque("details", &patch.details)?;
        validate_opaque("address", &patch.address)?;
        if let Some(amount) = patch.amount
            && amount < 0 {
                return Err(EngineError::validation("amount", "must not be negative"));
            }
        if let Some(ref name) = patch.customer_name
            && (name.trim().is_empty() || name.len() > MAX_NAME_LEN) {
                return Err(EngineError::validation("customer_name", "must be 1..=256 characters"));
            }

        let current = self
            .reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        scope.check(current.resource.tenant_id)?;

        let target_id = patch
            .resource
            .as_ref()
            .map(ResourceRef::resource_id)
            .unwrap_or(current.resource.id);

        let record = if target_id == current.resource.id {
            self.update_in_place(id, patch, scope).await?
        } else {
            self.move_between_resources(id, target_id, patch, scope).await?
        };

        metrics::counter!(crate::observability::MUTATIONS_TOTAL, "op" => "update").increment(1);
        metrics::histogram!(crate::observability::TXN_DURATION_SECONDS, "op" => "update")
            .record(start.elapsed().as_secs_f64());
        self.maybe_compact();
        Ok(record)
    }

    /// Same-resource field/date change: one lock, guard re-run excluding
    /// self, one WAL record, resync.
    async fn update_in_place(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        scope: TenantScope,
    ) -> Result<Reservation, EngineError> {
        let (current, mut guard) = self.lock_reservation_resource(&id).await?;
        scope.check(guard.tenant_id)?;

        let mut record = apply_patch(current, patch, &guard);
        validate_period(&record.period)?;

        if record.status.is_blocking()
            && let Some(clash) = find_blocking_overlap(&guard, &record.period, Some(id)) {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::Conflict {
                    reservation_id: clash.reservation_id,
                    until: clash.period.dropoff,
                });
            }

        record.resource = guard.snapshot(); // re-validate against canonical
        let event = Event::ReservationUpdated {
            record: Box::new(record.clone()),
        };
        self.wal_append(vec![event.clone()]).await?;

        self.reservations.insert(id, record.clone());
        self.resync_resource(&mut guard, today());
        self.notify.send(guard.id, &event);
        Ok(record)
    }

    /// Resource move: both resources locked in sorted id order, guard run on
    /// the target, one WAL record. A guard failure leaves both untouched.
    async fn move_between_resources(
        &self,
        id: Ulid,
        target_id: Ulid,
        patch: ReservationPatch,
        scope: TenantScope,
    ) -> Result<Reservation, EngineError> {
        loop {
            let current = self
                .reservations
                .get(&id)
                .map(|r| r.value().clone())
                .ok_or(EngineError::NotFound(id))?;
            let source_id = current.resource.id;

            let source = self
                .get_resource(&source_id)
                .ok_or(EngineError::NotFound(source_id))?;
            let target = self
                .get_resource(&target_id)
                .ok_or(EngineError::NotFound(target_id))?;

            // Acquire write locks in sorted order to prevent deadlocks.
            let (mut source_guard, mut target_guard) = if source_id < target_id {
                let s = source.write_owned().await;
                let t = target.write_owned().await;
                (s, t)
            } else {
                let t = target.write_owned().await;
                let s = source.write_owned().await;
                (s, t)
            };

            // The reservation may have moved while we waited for the locks.
            let current = self
                .reservations
                .get(&id)
                .map(|r| r.value().clone())
                .ok_or(EngineError::NotFound(id))?;
            if current.resource.id != source_id {
                continue;
            }

            scope.check(source_guard.tenant_id)?;
            scope.check(target_guard.tenant_id)?;
            if target_guard.windows.len() >= MAX_WINDOWS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many windows on resource"));
            }

            let mut record = apply_patch(current, patch, &target_guard);
            validate_period(&record.period)?;
            record.resource = target_guard.snapshot(); // canonical target attributes

            if record.status.is_blocking() {
                // Guard on the destination before anything is written.
                admit(&mut target_guard, record.window(), Some(id))?;
            }

            let event = Event::ReservationUpdated {
                record: Box::new(record.clone()),
            };
            if let Err(e) = self.wal_append(vec![event.clone()]).await {
                target_guard.remove_window(id);
                return Err(e);
            }

            self.reservations.insert(id, record.clone());
            let now = today();
            self.resync_resource(&mut source_guard, now);
            self.resync_resource(&mut target_guard, now);
            self.notify.send(source_guard.id, &event);
            self.notify.send(target_guard.id, &event);
            return Ok(record);
        }
    }

    /// Re-derive blocking classification and bring cache + resource status
    /// back in line. A transition into a blocking status re-runs the guard:
    /// a cancelled window's dates may have been given away.
    pub async fn set_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
        scope: TenantScope,
    ) -> Result<Reservation, EngineError> {
        let start = Instant::now();
        let (mut record, mut guard) = self.lock_reservation_resource(&id).await?;
        scope.check(guard.tenant_id)?;

        if record.status == status {
            return Ok(record);
        }

        if status.is_blocking() && !record.status.is_blocking()
            && let Some(clash) = find_blocking_overlap(&guard, &record.period, Some(id)) {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::Conflict {
                    reservation_id: clash.reservation_id,
                    until: clash.period.dropoff,
                });
            }

        let event = Event::ReservationStatusSet { id, status };
        self.wal_append(vec![event.clone()]).await?;

        record.status = status;
        self.reservations.insert(id, record.clone());
        self.resync_resource(&mut guard, today());
        self.notify.send(guard.id, &event);
        metrics::counter!(crate::observability::MUTATIONS_TOTAL, "op" => "set_status").increment(1);
        metrics::histogram!(crate::observability::TXN_DURATION_SECONDS, "op" => "set_status")
            .record(start.elapsed().as_secs_f64());
        self.maybe_compact();
        Ok(record)
    }

    pub async fn delete_reservation(
        &self,
        id: Ulid,
        scope: TenantScope,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let (record, mut guard) = self.lock_reservation_resource(&id).await?;
        scope.check(guard.tenant_id)?;

        let event = Event::ReservationDeleted { id };
        self.wal_append(vec![event.clone()]).await?;

        self.reservations.remove(&id);
        if let Some(intent_id) = &record.payment.intent_id {
            self.by_intent.remove(intent_id);
        }
        self.resync_resource(&mut guard, today());
        self.notify.send(guard.id, &event);
        metrics::counter!(crate::observability::MUTATIONS_TOTAL, "op" => "delete").increment(1);
        metrics::histogram!(crate::observability::TXN_DURATION_SECONDS, "op" => "delete")
            .record(start.elapsed().as_secs_f64());
        self.maybe_compact();
        Ok(())
    }

    // ── Payment correlation (gateway-facing) ─────────────────────

    /// Persist the provider intent id on a committed reservation. Callers
    /// treat failures as best-effort (the reservation is the evidence).
    pub async fn attach_intent(
        &self,
        reservation_id: Ulid,
        intent_id: &str,
    ) -> Result<(), EngineError> {
        let (mut record, guard) = self.lock_reservation_resource(&reservation_id).await?;

        let event = Event::IntentAttached {
            reservation_id,
            intent_id: intent_id.to_string(),
        };
        self.wal_append(vec![event.clone()]).await?;

        record.payment.intent_id = Some(intent_id.to_string());
        self.reservations.insert(reservation_id, record);
        self.by_intent.insert(intent_id.to_string(), reservation_id);
        self.notify.send(guard.id, &event);
        Ok(())
    }

    /// The one idempotent `(state, confirmation_id) -> state` transition,
    /// applied under the resource lock from both reconciliation paths.
    /// First confirmation wins; any later one is a no-op reporting success.
    pub async fn confirm_payment(
        &self,
        reservation_id: Ulid,
        confirmation_id: &str,
    ) -> Result<ConfirmOutcome, EngineError> {
        let (mut record, mut guard) = self.lock_reservation_resource(&reservation_id).await?;

        if record.payment.status == PaymentStatus::Paid {
            return Ok(ConfirmOutcome::AlreadyApplied(record));
        }

        let event = Event::PaymentConfirmed {
            reservation_id,
            confirmation_id: confirmation_id.to_string(),
        };
        self.wal_append(vec![event.clone()]).await?;

        record.payment.status = PaymentStatus::Paid;
        record.payment.confirmation_id = Some(confirmation_id.to_string());
        // Only a pending reservation is promoted; a cancelled one stays
        // cancelled (its dates may belong to someone else by now).
        if record.status == ReservationStatus::Pending {
            record.status = ReservationStatus::Active;
        }
        self.reservations.insert(reservation_id, record.clone());
        self.resync_resource(&mut guard, today());
        self.notify.send(guard.id, &event);
        self.maybe_compact();
        Ok(ConfirmOutcome::Applied(record))
    }

    /// Fetch the reservation record and lock its owning resource, retrying
    /// if a concurrent move changed the owner while we waited.
    async fn lock_reservation_resource(
        &self,
        id: &Ulid,
    ) -> Result<(Reservation, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        loop {
            let record = self
                .reservations
                .get(id)
                .map(|r| r.value().clone())
                .ok_or(EngineError::NotFound(*id))?;
            let rs = self
                .get_resource(&record.resource.id)
                .ok_or(EngineError::NotFound(record.resource.id))?;
            let guard = rs.write_owned().await;
            match self.reservations.get(id) {
                Some(r) if r.resource.id == guard.id => return Ok((r.value().clone(), guard)),
                Some(_) => continue, // moved while we waited; retry
                None => return Err(EngineError::NotFound(*id)),
            }
        }
    }
}

fn apply_patch(mut record: Reservation, patch: ReservationPatch, target: &ResourceState) -> Reservation {
    record.period = Period {
        pickup: patch.pickup.unwrap_or(record.period.pickup),
        dropoff: patch.dropoff.unwrap_or(record.period.dropoff),
    };
    if let Some(amount) = patch.amount {
        record.amount = amount;
    }
    if let Some(name) = patch.customer_name {
        record.customer.name = name;
    }
    if let Some(phone) = patch.customer_phone {
        record.customer.phone = Some(phone);
    }
    if let Some(details) = patch.details {
        record.details = Some(details);
    }
    if let Some(address) = patch.address {
        record.address = Some(address);
    }
    record.currency = target.currency.clone();
    record
}
