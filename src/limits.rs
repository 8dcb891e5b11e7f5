//! Hard limits. Everything here surfaces as `EngineError::LimitExceeded`.

/// Max resources (vehicles) held by one engine.
pub const MAX_RESOURCES: usize = 100_000;

/// Max cached booking windows per resource.
pub const MAX_WINDOWS_PER_RESOURCE: usize = 10_000;

/// Longest admissible rental, in days (inclusive span).
pub const MAX_RENTAL_DAYS: i64 = 366;

/// Reservations must fall inside [MIN_VALID_YEAR, MAX_VALID_YEAR].
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_CURRENCY_LEN: usize = 8;

/// Max tracked guest identities.
pub const MAX_GUESTS: usize = 1_000_000;

/// Pagination cap for reservation listings.
pub const MAX_PAGE_SIZE: usize = 500;

/// Largest webhook body the gateway will verify.
pub const MAX_WEBHOOK_PAYLOAD_BYTES: usize = 64 * 1024;

/// Opaque detail/address payloads are capped when serialized.
pub const MAX_OPAQUE_PAYLOAD_BYTES: usize = 16 * 1024;
