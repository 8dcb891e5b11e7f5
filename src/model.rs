use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar day — the only reservation granularity.
pub type Day = NaiveDate;

/// Inclusive rental window `[pickup, dropoff]`, day granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub pickup: Day,
    pub dropoff: Day,
}

impl Period {
    pub fn new(pickup: Day, dropoff: Day) -> Self {
        debug_assert!(pickup <= dropoff, "Period pickup must not be after dropoff");
        Self { pickup, dropoff }
    }

    /// Inclusive length in days: a same-day rental is 1 day.
    pub fn len_days(&self) -> i64 {
        (self.dropoff - self.pickup).num_days() + 1
    }

    /// Closed-interval overlap: touching endpoints DO overlap, so a same-day
    /// turnover (one dropoff on another's pickup day) counts as a clash.
    pub fn overlaps(&self, other: &Period) -> bool {
        self.pickup <= other.dropoff && other.pickup <= self.dropoff
    }

    pub fn contains_day(&self, day: Day) -> bool {
        self.pickup <= day && day <= self.dropoff
    }
}

/// Reservation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Active,
    Upcoming,
    Completed,
    Cancelled,
}

/// The statuses that occupy a resource's calendar. Defined once; both the
/// conflict guard and the availability projector consult this set.
pub const BLOCKING_STATUSES: [ReservationStatus; 3] = [
    ReservationStatus::Pending,
    ReservationStatus::Active,
    ReservationStatus::Upcoming,
];

impl ReservationStatus {
    pub fn is_blocking(self) -> bool {
        BLOCKING_STATUSES.contains(&self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Available,
    Rented,
    /// Manual override set by the fleet collaborator; derivation never
    /// clears it.
    Maintenance,
}

/// One cached calendar entry on a resource. Non-authoritative: a projection
/// of the ledger, rebuilt by the resync helper after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingWindow {
    pub reservation_id: Ulid,
    pub period: Period,
    pub status: ReservationStatus,
}

/// A rentable vehicle as the engine sees it: canonical pricing/tenant fields
/// plus the denormalized window cache. The record itself is owned by the
/// resource-management collaborator; the engine only derives `status` and
/// maintains `windows`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: String,
    /// Daily rate in minor units of `currency`.
    pub daily_rate: i64,
    pub currency: String,
    pub status: ResourceStatus,
    /// Blocking windows, sorted by `period.pickup`.
    pub windows: Vec<BookingWindow>,
}

impl ResourceState {
    pub fn new(id: Ulid, tenant_id: Ulid, name: String, daily_rate: i64, currency: String) -> Self {
        Self {
            id,
            tenant_id,
            name,
            daily_rate,
            currency,
            status: ResourceStatus::Available,
            windows: Vec::new(),
        }
    }

    /// Insert a window maintaining sort order by pickup day.
    pub fn insert_window(&mut self, window: BookingWindow) {
        let pos = self
            .windows
            .binary_search_by_key(&window.period.pickup, |w| w.period.pickup)
            .unwrap_or_else(|e| e);
        self.windows.insert(pos, window);
    }

    /// Remove the window belonging to a reservation.
    pub fn remove_window(&mut self, reservation_id: Ulid) -> Option<BookingWindow> {
        if let Some(pos) = self.windows.iter().position(|w| w.reservation_id == reservation_id) {
            Some(self.windows.remove(pos))
        } else {
            None
        }
    }

    /// Windows whose period overlaps the query (inclusive ends). Binary
    /// search skips windows picked up after the query's dropoff.
    pub fn overlapping(&self, query: &Period) -> impl Iterator<Item = &BookingWindow> {
        // Everything at index >= right_bound picks up after query.dropoff.
        let right_bound = self
            .windows
            .partition_point(|w| w.period.pickup <= query.dropoff);
        self.windows[..right_bound]
            .iter()
            .filter(move |w| w.period.dropoff >= query.pickup)
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name.clone(),
            daily_rate: self.daily_rate,
            currency: self.currency.clone(),
        }
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name.clone(),
            daily_rate: self.daily_rate,
            currency: self.currency.clone(),
            status: self.status,
        }
    }
}

/// Customer contact as captured on the reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub guest: bool,
}

/// Resource attributes frozen onto a reservation at write time. Always
/// re-fetched from the canonical record, never trusted from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: String,
    pub daily_rate: i64,
    pub currency: String,
}

/// How callers reference a resource: a raw id, or an embedded snapshot as
/// older clients send it. The embedded form tolerates the historical field
/// aliases for the tenant id; normalization happens once, at this boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResourceRef {
    Id(Ulid),
    Embedded(EmbeddedResourceRef),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddedResourceRef {
    #[serde(alias = "_id", alias = "resourceId", alias = "vehicleId")]
    pub id: Ulid,
    #[serde(
        default,
        alias = "tenantId",
        alias = "companyId",
        alias = "company_id",
        alias = "ownerId",
        alias = "owner_id"
    )]
    pub tenant_id: Option<Ulid>,
}

impl ResourceRef {
    /// Collapse either shape to the canonical resource id. Embedded tenant
    /// and pricing fields are deliberately discarded — the engine re-reads
    /// them from the canonical record at write time.
    pub fn resource_id(&self) -> Ulid {
        match self {
            ResourceRef::Id(id) => *id,
            ResourceRef::Embedded(e) => e.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentState {
    pub status: PaymentStatus,
    /// Provider-side intent correlating this reservation, once opened.
    pub intent_id: Option<String>,
    /// The single accepted confirmation id; set exactly once.
    pub confirmation_id: Option<String>,
}

impl PaymentState {
    pub fn unpaid() -> Self {
        Self {
            status: PaymentStatus::Pending,
            intent_id: None,
            confirmation_id: None,
        }
    }
}

/// Authoritative reservation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub customer: CustomerSnapshot,
    pub resource: ResourceSnapshot,
    pub period: Period,
    pub created_at: DateTime<Utc>,
    pub status: ReservationStatus,
    /// Total amount in minor units of `currency`.
    pub amount: i64,
    pub currency: String,
    pub payment: PaymentState,
    /// Opaque collaborator payloads, stored verbatim.
    pub details: Option<serde_json::Value>,
    pub address: Option<serde_json::Value>,
}

impl Reservation {
    pub fn window(&self) -> BookingWindow {
        BookingWindow {
            reservation_id: self.id,
            period: self.period,
            status: self.status,
        }
    }
}

/// WAL record payload — flat, no nesting. One committed transaction is one
/// `Vec<Event>` framed as a single WAL record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        tenant_id: Ulid,
        name: String,
        daily_rate: i64,
        currency: String,
        status: ResourceStatus,
    },
    ResourceStatusSet {
        id: Ulid,
        status: ResourceStatus,
    },
    ReservationCreated {
        record: Box<Reservation>,
    },
    ReservationUpdated {
        record: Box<Reservation>,
    },
    ReservationStatusSet {
        id: Ulid,
        status: ReservationStatus,
    },
    ReservationDeleted {
        id: Ulid,
    },
    IntentAttached {
        reservation_id: Ulid,
        intent_id: String,
    },
    PaymentConfirmed {
        reservation_id: Ulid,
        confirmation_id: String,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: String,
    pub daily_rate: i64,
    pub currency: String,
    pub status: ResourceStatus,
}
