mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{classify, derive_status, merge_windows, Availability};
pub use error::EngineError;
pub use mutations::{ConfirmOutcome, CreateReservation, RegisterResource, ReservationPatch, TenantScope};
pub use queries::{Page, ReservationFilter, ResourceAvailability};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::identity::GuestDirectory;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResource = Arc<RwLock<ResourceState>>;

/// Upper bound on one transaction's WAL acknowledgement. On expiry the
/// caller aborts, rolls back any staged cache entry, and reports a
/// retryable error.
const TXN_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The reservation engine: resource directory + window caches, the
/// authoritative reservation ledger, and the indices the gateway needs.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResource>,
    /// Authoritative ledger. Records are only mutated while holding the
    /// owning resource's write lock.
    pub(super) reservations: DashMap<Ulid, Reservation>,
    /// Provider intent id → reservation id.
    pub(super) by_intent: DashMap<String, Ulid>,
    pub(super) guests: GuestDirectory,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    compact_threshold: u64,
    compacting: AtomicBool,
    /// Back-reference for spawning maintenance tasks from `&self` methods.
    weak_self: Weak<Engine>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        compact_threshold: u64,
    ) -> io::Result<Arc<Self>> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Arc::new_cyclic(|weak| Self {
            resources: DashMap::new(),
            reservations: DashMap::new(),
            by_intent: DashMap::new(),
            guests: GuestDirectory::new(),
            wal_tx,
            notify,
            compact_threshold,
            compacting: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        for event in &events {
            engine.apply_replay_event(event);
        }

        // Caches and derived statuses are projections — rebuild them once
        // after replay instead of logging them.
        let today = conflict::today();
        for entry in engine.resources.iter() {
            let rs = entry.value().clone();
            let mut guard = rs.try_write().expect("replay: uncontended write");
            engine.resync_resource(&mut guard, today);
        }
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(engine.resources.len() as f64);

        Ok(engine)
    }

    /// Apply one replayed event to the ledger and directory. Window caches
    /// and derived statuses are rebuilt afterwards; manual status overrides
    /// are applied here so they survive the rebuild.
    fn apply_replay_event(&self, event: &Event) {
        match event {
            Event::ResourceRegistered {
                id,
                tenant_id,
                name,
                daily_rate,
                currency,
                status,
            } => {
                let mut rs =
                    ResourceState::new(*id, *tenant_id, name.clone(), *daily_rate, currency.clone());
                rs.status = *status;
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::ResourceStatusSet { id, status } => {
                if let Some(entry) = self.resources.get(id) {
                    let rs = entry.value().clone();
                    rs.try_write().expect("replay: uncontended write").status = *status;
                }
            }
            Event::ReservationCreated { record } | Event::ReservationUpdated { record } => {
                if let Some(intent_id) = &record.payment.intent_id {
                    self.by_intent.insert(intent_id.clone(), record.id);
                }
                self.guests.restore(&record.customer);
                self.reservations.insert(record.id, (**record).clone());
            }
            Event::ReservationStatusSet { id, status } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.status = *status;
                }
            }
            Event::ReservationDeleted { id } => {
                if let Some((_, r)) = self.reservations.remove(id)
                    && let Some(intent_id) = &r.payment.intent_id {
                        self.by_intent.remove(intent_id);
                    }
            }
            Event::IntentAttached {
                reservation_id,
                intent_id,
            } => {
                if let Some(mut r) = self.reservations.get_mut(reservation_id) {
                    r.payment.intent_id = Some(intent_id.clone());
                    self.by_intent.insert(intent_id.clone(), *reservation_id);
                }
            }
            Event::PaymentConfirmed {
                reservation_id,
                confirmation_id,
            } => {
                if let Some(mut r) = self.reservations.get_mut(reservation_id)
                    && r.payment.status == PaymentStatus::Pending {
                        r.payment.status = PaymentStatus::Paid;
                        r.payment.confirmation_id = Some(confirmation_id.clone());
                        if r.status == ReservationStatus::Pending {
                            r.status = ReservationStatus::Active;
                        }
                    }
            }
        }
    }

    /// Write one transaction to the WAL via the background group-commit
    /// writer, bounded by the transaction deadline.
    pub(super) async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        let acked = tokio::time::timeout(TXN_TIMEOUT, rx)
            .await
            .map_err(|_| EngineError::Timeout)?;
        acked
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResource> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// The ledger's blocking windows for one resource, sorted by pickup.
    pub(super) fn ledger_windows(&self, resource_id: Ulid) -> Vec<BookingWindow> {
        let mut windows: Vec<BookingWindow> = self
            .reservations
            .iter()
            .filter(|r| r.resource.id == resource_id && r.status.is_blocking())
            .map(|r| r.window())
            .collect();
        windows.sort_by_key(|w| w.period.pickup);
        windows
    }

    /// Rebuild a resource's window cache from the ledger and re-derive its
    /// status. The single place cache and status are brought back in line;
    /// every mutation ends here, never partially.
    pub(super) fn resync_resource(&self, rs: &mut ResourceState, today: Day) {
        rs.windows = self.ledger_windows(rs.id);
        rs.status = derive_status(rs.status, &rs.windows, today);
    }

    /// Fire-and-forget compaction once the threshold is crossed. At most one
    /// compaction runs at a time; triggered after commits rather than on a
    /// timer.
    pub(super) fn maybe_compact(&self) {
        if self.compact_threshold == 0 {
            return;
        }
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let appends = engine.wal_appends_since_compact().await;
            if appends < engine.compact_threshold {
                return;
            }
            if engine
                .compacting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return; // one at a time
            }
            if let Err(e) = engine.compact_wal().await {
                tracing::warn!("WAL compaction failed: {e}");
            }
            engine.compacting.store(false, Ordering::Release);
        });
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: one registration per resource, one
    /// creation per reservation (records carry status and payment state).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        // Clone the Arcs out first — never await while holding a map shard.
        let resources: Vec<SharedResource> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            events.push(Event::ResourceRegistered {
                id: guard.id,
                tenant_id: guard.tenant_id,
                name: guard.name.clone(),
                daily_rate: guard.daily_rate,
                currency: guard.currency.clone(),
                status: guard.status,
            });
        }
        for r in self.reservations.iter() {
            events.push(Event::ReservationCreated {
                record: Box::new(r.value().clone()),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
