//! End-to-end reconciliation flows: intent creation, webhook and client
//! confirmation in either order, signature rejection, and provider-failure
//! compensation — all against a mock provider.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ulid::Ulid;

use motorpool::engine::{
    CreateReservation, Engine, EngineError, RegisterResource, ReservationFilter, TenantScope,
};
use motorpool::model::{Day, PaymentStatus, ReservationStatus, ResourceRef};
use motorpool::notify::NotifyHub;
use motorpool::payment::{
    signature, ClientConfirmation, GatewayError, GatewaySecrets, IntentRequest, IntentResponse,
    PaymentProvider, ProviderError, ReconcileOutcome, ReconciliationGateway,
};

const WEBHOOK_SECRET: &str = "whsec_test";
const CLIENT_SECRET: &str = "cksec_test";

struct MockProvider {
    fail: bool,
    calls: AtomicUsize,
}

impl MockProvider {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn create_intent(&self, req: &IntentRequest) -> Result<IntentResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Rejected {
                status: 503,
                body: "provider down".into(),
            });
        }
        Ok(IntentResponse {
            intent_id: format!("pi_{}_{n}", req.reference),
            amount: req.amount,
            currency: req.currency.clone(),
        })
    }
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("motorpool_test_gateway");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn d(s: &str) -> Day {
    s.parse().unwrap()
}

async fn setup(name: &str, provider: Arc<MockProvider>) -> (Arc<Engine>, ReconciliationGateway, Ulid) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let engine = Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), 1000).unwrap();
    let vehicle = Ulid::new();
    engine
        .register_resource(RegisterResource {
            id: vehicle,
            tenant_id: Ulid::new(),
            name: "Perodua Bezza".into(),
            daily_rate: 10000,
            currency: "MYR".into(),
        })
        .await
        .unwrap();
    let gateway = ReconciliationGateway::new(
        engine.clone(),
        provider,
        GatewaySecrets {
            webhook_secret: WEBHOOK_SECRET.into(),
            client_secret: CLIENT_SECRET.into(),
        },
    );
    (engine, gateway, vehicle)
}

fn booking(vehicle: Ulid, pickup: &str, dropoff: &str) -> CreateReservation {
    CreateReservation {
        resource: ResourceRef::Id(vehicle),
        customer_id: None,
        customer_name: "Farid Kamil".into(),
        customer_email: "farid@example.com".into(),
        customer_phone: None,
        pickup: d(pickup),
        dropoff: d(dropoff),
        amount: 30000,
        details: None,
        address: None,
    }
}

fn captured_webhook(intent_id: &str, confirmation_id: &str) -> (Vec<u8>, String) {
    let body = serde_json::json!({
        "event": "payment.captured",
        "intent_id": intent_id,
        "confirmation_id": confirmation_id,
    });
    let raw = serde_json::to_vec(&body).unwrap();
    let sig = signature::sign(WEBHOOK_SECRET, &raw);
    (raw, sig)
}

fn client_confirmation(order_id: &str, intent_id: &str, transaction_id: &str) -> ClientConfirmation {
    let canonical = signature::client_payload(order_id, intent_id, "captured");
    ClientConfirmation {
        order_id: order_id.into(),
        intent_id: intent_id.into(),
        transaction_id: transaction_id.into(),
        status: "captured".into(),
        signature: signature::sign(CLIENT_SECRET, canonical.as_bytes()),
    }
}

#[tokio::test]
async fn paid_flow_webhook_then_client_confirm() {
    let (engine, gateway, vehicle) = setup("paid_flow.wal", MockProvider::ok()).await;

    let opened = gateway
        .open_intent(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();
    assert_eq!(opened.amount, 30000);
    assert_eq!(opened.currency, "MYR");
    assert_eq!(opened.reservation.status, ReservationStatus::Pending);
    assert_eq!(opened.reservation.payment.status, PaymentStatus::Pending);

    // Webhook lands first: source of truth.
    let (raw, sig) = captured_webhook(&opened.intent_id, "txn_001");
    let outcome = gateway.handle_webhook(&raw, &sig).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied(_)));

    let paid = engine.get_reservation(&opened.reservation.id).unwrap();
    assert_eq!(paid.status, ReservationStatus::Active);
    assert_eq!(paid.payment.status, PaymentStatus::Paid);
    assert_eq!(paid.payment.confirmation_id.as_deref(), Some("txn_001"));

    // The client redirect arrives later for the same payment: success, no
    // modification.
    let confirm = client_confirmation(
        &opened.reservation.id.to_string(),
        &opened.intent_id,
        "txn_001",
    );
    let outcome = gateway.confirm_client(confirm).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::AlreadyApplied(_)));
    assert_eq!(engine.get_reservation(&opened.reservation.id).unwrap(), paid);
}

#[tokio::test]
async fn client_confirm_then_webhook_converges() {
    let (engine, gateway, vehicle) = setup("confirm_order.wal", MockProvider::ok()).await;
    let opened = gateway
        .open_intent(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();

    let confirm = client_confirmation(
        &opened.reservation.id.to_string(),
        &opened.intent_id,
        "txn_client",
    );
    let outcome = gateway.confirm_client(confirm).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied(_)));
    let state = engine.get_reservation(&opened.reservation.id).unwrap();

    // The webhook for the same capture arrives second.
    let (raw, sig) = captured_webhook(&opened.intent_id, "txn_webhook");
    let outcome = gateway.handle_webhook(&raw, &sig).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::AlreadyApplied(_)));

    // Exactly one accepted confirmation id — the first.
    let final_state = engine.get_reservation(&opened.reservation.id).unwrap();
    assert_eq!(final_state, state);
    assert_eq!(final_state.payment.confirmation_id.as_deref(), Some("txn_client"));
}

#[tokio::test]
async fn webhook_replay_is_idempotent() {
    let (engine, gateway, vehicle) = setup("webhook_replay.wal", MockProvider::ok()).await;
    let opened = gateway
        .open_intent(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();

    let (raw, sig) = captured_webhook(&opened.intent_id, "txn_once");
    gateway.handle_webhook(&raw, &sig).await.unwrap();
    let after_first = engine.get_reservation(&opened.reservation.id).unwrap();

    let outcome = gateway.handle_webhook(&raw, &sig).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::AlreadyApplied(_)));
    assert_eq!(engine.get_reservation(&opened.reservation.id).unwrap(), after_first);
}

#[tokio::test]
async fn tampered_webhook_is_rejected() {
    let (engine, gateway, vehicle) = setup("tampered.wal", MockProvider::ok()).await;
    let opened = gateway
        .open_intent(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();

    let (mut raw, sig) = captured_webhook(&opened.intent_id, "txn_evil");
    raw[0] ^= 0x01; // flip one bit
    assert!(matches!(
        gateway.handle_webhook(&raw, &sig).await,
        Err(GatewayError::Signature)
    ));

    // Wrong secret on the client path.
    let canonical =
        signature::client_payload(&opened.reservation.id.to_string(), &opened.intent_id, "captured");
    let confirm = ClientConfirmation {
        order_id: opened.reservation.id.to_string(),
        intent_id: opened.intent_id.clone(),
        transaction_id: "txn_evil".into(),
        status: "captured".into(),
        signature: signature::sign("wrong_secret", canonical.as_bytes()),
    };
    assert!(matches!(
        gateway.confirm_client(confirm).await,
        Err(GatewayError::Signature)
    ));

    // Reservation untouched either way.
    let state = engine.get_reservation(&opened.reservation.id).unwrap();
    assert_eq!(state.status, ReservationStatus::Pending);
    assert_eq!(state.payment.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn non_capture_events_are_ignored() {
    let (_engine, gateway, vehicle) = setup("ignored.wal", MockProvider::ok()).await;
    let opened = gateway
        .open_intent(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();

    let body = serde_json::json!({
        "event": "payment.authorized",
        "intent_id": opened.intent_id,
        "confirmation_id": "txn_early",
    });
    let raw = serde_json::to_vec(&body).unwrap();
    let sig = signature::sign(WEBHOOK_SECRET, &raw);
    let outcome = gateway.handle_webhook(&raw, &sig).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Ignored);
}

#[tokio::test]
async fn webhook_for_unknown_intent_is_not_found() {
    let (_engine, gateway, _vehicle) = setup("unknown_intent.wal", MockProvider::ok()).await;
    let (raw, sig) = captured_webhook("pi_never_issued", "txn_x");
    assert!(matches!(
        gateway.handle_webhook(&raw, &sig).await,
        Err(GatewayError::UnknownIntent(_))
    ));
}

#[tokio::test]
async fn open_intent_conflict_creates_nothing() {
    let (engine, gateway, vehicle) = setup("intent_conflict.wal", MockProvider::ok()).await;
    gateway
        .open_intent(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();

    let err = gateway
        .open_intent(booking(vehicle, "2025-07-04", "2025-07-06"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Engine(EngineError::Conflict { .. })
    ));
    let all = engine.list_reservations(&ReservationFilter::default()).unwrap();
    assert_eq!(all.total, 1);
}

#[tokio::test]
async fn provider_failure_compensates_with_cancellation() {
    let (engine, gateway, vehicle) = setup("provider_down.wal", MockProvider::failing()).await;

    let err = gateway
        .open_intent(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap_err();
    let reservation_id = match err {
        GatewayError::Provider { reservation_id, .. } => reservation_id,
        other => panic!("expected provider error, got {other:?}"),
    };

    // The reservation is durable evidence, compensated to cancelled — and
    // the dates are free again.
    let record = engine.get_reservation(&reservation_id).unwrap();
    assert_eq!(record.status, ReservationStatus::Cancelled);
    engine
        .create_reservation(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();
}

#[tokio::test]
async fn client_confirm_falls_back_to_order_reference() {
    // If the best-effort intent attach never landed, the client path still
    // resolves the reservation through the order reference.
    let (engine, gateway, vehicle) = setup("order_fallback.wal", MockProvider::ok()).await;
    let record = engine
        .create_reservation(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();

    let confirm = client_confirmation(&record.id.to_string(), "pi_detached", "txn_fb");
    let outcome = gateway.confirm_client(confirm).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied(_)));
    let state = engine.get_reservation(&record.id).unwrap();
    assert_eq!(state.payment.status, PaymentStatus::Paid);
    assert_eq!(state.status, ReservationStatus::Active);
}

#[tokio::test]
async fn racing_confirmation_paths_accept_exactly_one() {
    let (engine, gateway, vehicle) = setup("racing.wal", MockProvider::ok()).await;
    let opened = gateway
        .open_intent(booking(vehicle, "2025-07-01", "2025-07-05"))
        .await
        .unwrap();

    let gateway = Arc::new(gateway);
    let (raw, sig) = captured_webhook(&opened.intent_id, "txn_hook");
    let confirm = client_confirmation(
        &opened.reservation.id.to_string(),
        &opened.intent_id,
        "txn_redirect",
    );

    let g1 = gateway.clone();
    let g2 = gateway.clone();
    let (wh, cl) = tokio::join!(
        tokio::spawn(async move { g1.handle_webhook(&raw, &sig).await }),
        tokio::spawn(async move { g2.confirm_client(confirm).await }),
    );
    let outcomes = [wh.unwrap().unwrap(), cl.unwrap().unwrap()];

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, ReconcileOutcome::Applied(_)))
        .count();
    assert_eq!(applied, 1, "exactly one path may apply the transition");

    let state = engine.get_reservation(&opened.reservation.id).unwrap();
    assert_eq!(state.payment.status, PaymentStatus::Paid);
    let accepted = state.payment.confirmation_id.unwrap();
    assert!(accepted == "txn_hook" || accepted == "txn_redirect");
}
