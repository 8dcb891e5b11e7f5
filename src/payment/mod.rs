//! Payment Reconciliation Gateway.
//!
//! Opens a provider-side payment intent for a freshly committed pending
//! reservation, then reconciles the two confirmation paths — provider
//! webhook (source of truth) and client redirect (advisory) — onto the
//! engine's single idempotent transition. Either path may arrive first,
//! twice, or concurrently; the outcome is the same.

pub mod provider;
pub mod signature;

pub use provider::{
    HttpPaymentProvider, IntentRequest, IntentResponse, PaymentProvider, ProviderError,
};

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{ConfirmOutcome, CreateReservation, Engine, EngineError, TenantScope};
use crate::limits::MAX_WEBHOOK_PAYLOAD_BYTES;
use crate::model::{Reservation, ReservationStatus};

#[derive(Debug)]
pub enum GatewayError {
    Engine(EngineError),
    /// Intent creation failed after the reservation committed. The
    /// reservation is durable (and compensated to cancelled); callers retry
    /// intent creation, never the reservation.
    Provider {
        reservation_id: Ulid,
        message: String,
    },
    /// Signature mismatch; the reservation is untouched.
    Signature,
    /// No reservation correlates to the given intent.
    UnknownIntent(String),
    Malformed(&'static str),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Engine(e) => write!(f, "{e}"),
            GatewayError::Provider {
                reservation_id,
                message,
            } => {
                write!(
                    f,
                    "payment provider failed for reservation {reservation_id}: {message}"
                )
            }
            GatewayError::Signature => write!(f, "confirmation signature mismatch"),
            GatewayError::UnknownIntent(intent) => {
                write!(f, "no reservation for intent {intent}")
            }
            GatewayError::Malformed(what) => write!(f, "malformed confirmation: {what}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<EngineError> for GatewayError {
    fn from(e: EngineError) -> Self {
        GatewayError::Engine(e)
    }
}

/// Secrets for the two confirmation paths. Providers commonly issue separate
/// webhook and checkout secrets; they may be the same string.
#[derive(Debug, Clone)]
pub struct GatewaySecrets {
    pub webhook_secret: String,
    pub client_secret: String,
}

/// Result of `open_intent`: the durable reservation plus the provider's
/// intent correlation.
#[derive(Debug, Clone)]
pub struct OpenedIntent {
    pub reservation: Reservation,
    pub intent_id: String,
    pub amount: i64,
    pub currency: String,
}

/// Verified provider webhook body.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(alias = "type")]
    pub event: String,
    #[serde(alias = "intentId")]
    pub intent_id: String,
    #[serde(alias = "confirmationId", alias = "transactionId")]
    pub confirmation_id: String,
}

/// Client-side confirmation forwarded after checkout redirect.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfirmation {
    /// Our order reference — the reservation id as issued at checkout.
    #[serde(alias = "orderId")]
    pub order_id: String,
    #[serde(alias = "intentId")]
    pub intent_id: String,
    #[serde(alias = "transactionId")]
    pub transaction_id: String,
    pub status: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied(Reservation),
    /// A confirmation already landed; nothing changed, success reported.
    AlreadyApplied(Reservation),
    /// Verified but not a capture event; nothing to do.
    Ignored,
}

impl From<ConfirmOutcome> for ReconcileOutcome {
    fn from(o: ConfirmOutcome) -> Self {
        match o {
            ConfirmOutcome::Applied(r) => ReconcileOutcome::Applied(r),
            ConfirmOutcome::AlreadyApplied(r) => ReconcileOutcome::AlreadyApplied(r),
        }
    }
}

const CAPTURED: &str = "captured";

pub struct ReconciliationGateway {
    engine: Arc<Engine>,
    provider: Arc<dyn PaymentProvider>,
    secrets: GatewaySecrets,
}

impl ReconciliationGateway {
    pub fn new(
        engine: Arc<Engine>,
        provider: Arc<dyn PaymentProvider>,
        secrets: GatewaySecrets,
    ) -> Self {
        Self {
            engine,
            provider,
            secrets,
        }
    }

    /// Create the pending reservation (conflict guard re-validated inside
    /// the engine transaction), then open a provider intent correlated to
    /// it. Intent-id persistence is best-effort; provider failure after the
    /// commit compensates by cancelling the reservation.
    pub async fn open_intent(&self, input: CreateReservation) -> Result<OpenedIntent, GatewayError> {
        let reservation = self.engine.create_reservation(input).await?;

        let request = IntentRequest {
            amount: reservation.amount,
            currency: reservation.currency.clone(),
            reference: reservation.id.to_string(),
            metadata: serde_json::json!({
                "reservation_id": reservation.id.to_string(),
                "resource_id": reservation.resource.id.to_string(),
                "pickup": reservation.period.pickup,
                "dropoff": reservation.period.dropoff,
            }),
        };

        match self.provider.create_intent(&request).await {
            Ok(resp) => {
                // Best-effort: the committed reservation is the evidence even
                // if the correlation fails to persist.
                if let Err(e) = self.engine.attach_intent(reservation.id, &resp.intent_id).await {
                    warn!(
                        reservation = %reservation.id,
                        intent = %resp.intent_id,
                        "intent id not persisted: {e}"
                    );
                }
                info!(reservation = %reservation.id, intent = %resp.intent_id, "payment intent opened");
                Ok(OpenedIntent {
                    reservation,
                    intent_id: resp.intent_id,
                    amount: resp.amount,
                    currency: resp.currency,
                })
            }
            Err(e) => {
                metrics::counter!(crate::observability::PROVIDER_FAILURES_TOTAL).increment(1);
                warn!(reservation = %reservation.id, "intent creation failed: {e}");
                // Compensating step, deliberately outside any transaction:
                // free the dates, keep the record.
                if let Err(cancel_err) = self
                    .engine
                    .set_reservation_status(
                        reservation.id,
                        ReservationStatus::Cancelled,
                        TenantScope::unscoped(),
                    )
                    .await
                {
                    warn!(
                        reservation = %reservation.id,
                        "compensating cancellation failed: {cancel_err}"
                    );
                }
                Err(GatewayError::Provider {
                    reservation_id: reservation.id,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Provider webhook — source of truth. The signature covers the raw
    /// payload bytes exactly as received.
    pub async fn handle_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> Result<ReconcileOutcome, GatewayError> {
        if raw_payload.len() > MAX_WEBHOOK_PAYLOAD_BYTES {
            return Err(GatewayError::Malformed("payload too large"));
        }
        if !signature::verify(&self.secrets.webhook_secret, raw_payload, signature_header) {
            metrics::counter!(crate::observability::SIGNATURE_REJECTS_TOTAL, "path" => "webhook")
                .increment(1);
            return Err(GatewayError::Signature);
        }

        let event: WebhookEvent = serde_json::from_slice(raw_payload)
            .map_err(|_| GatewayError::Malformed("webhook body is not valid JSON"))?;
        if event.event != format!("payment.{CAPTURED}") && event.event != CAPTURED {
            debug!(event = %event.event, "ignoring non-capture webhook");
            return Ok(ReconcileOutcome::Ignored);
        }

        let reservation = self
            .engine
            .find_reservation_by_intent(&event.intent_id)
            .ok_or_else(|| GatewayError::UnknownIntent(event.intent_id.clone()))?;

        let outcome = self
            .engine
            .confirm_payment(reservation.id, &event.confirmation_id)
            .await?;
        metrics::counter!(
            crate::observability::CONFIRMATIONS_TOTAL,
            "path" => "webhook",
            "outcome" => outcome_label(&outcome)
        )
        .increment(1);
        Ok(outcome.into())
    }

    /// Client confirmation — advisory. The expected signature is recomputed
    /// from the order/payment identifiers and the shared secret; a match
    /// feeds the same idempotent transition the webhook uses.
    pub async fn confirm_client(
        &self,
        confirmation: ClientConfirmation,
    ) -> Result<ReconcileOutcome, GatewayError> {
        let canonical = signature::client_payload(
            &confirmation.order_id,
            &confirmation.intent_id,
            &confirmation.status,
        );
        if !signature::verify(
            &self.secrets.client_secret,
            canonical.as_bytes(),
            &confirmation.signature,
        ) {
            metrics::counter!(crate::observability::SIGNATURE_REJECTS_TOTAL, "path" => "client")
                .increment(1);
            return Err(GatewayError::Signature);
        }
        if confirmation.status != CAPTURED {
            debug!(status = %confirmation.status, "ignoring non-capture client confirmation");
            return Ok(ReconcileOutcome::Ignored);
        }

        // Intent index first; fall back to the order reference in case the
        // best-effort intent attach never landed.
        let reservation = self
            .engine
            .find_reservation_by_intent(&confirmation.intent_id)
            .or_else(|| {
                confirmation
                    .order_id
                    .parse::<Ulid>()
                    .ok()
                    .and_then(|id| self.engine.get_reservation(&id))
            })
            .ok_or_else(|| GatewayError::UnknownIntent(confirmation.intent_id.clone()))?;

        let outcome = self
            .engine
            .confirm_payment(reservation.id, &confirmation.transaction_id)
            .await?;
        metrics::counter!(
            crate::observability::CONFIRMATIONS_TOTAL,
            "path" => "client",
            "outcome" => outcome_label(&outcome)
        )
        .increment(1);
        Ok(outcome.into())
    }
}

fn outcome_label(outcome: &ConfirmOutcome) -> &'static str {
    match outcome {
        ConfirmOutcome::Applied(_) => "applied",
        ConfirmOutcome::AlreadyApplied(_) => "noop",
    }
}
