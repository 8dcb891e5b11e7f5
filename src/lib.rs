//! motorpool — reservation and availability engine for dated rental
//! resources.
//!
//! The engine keeps two representations of the calendar: the authoritative
//! reservation ledger, and a per-resource cache of blocking booking windows
//! used for conflict admission and availability projection. Every mutation is
//! a single WAL-backed transaction that ends by resyncing the cache from the
//! ledger, so the two can never drift past a commit boundary.
//!
//! HTTP routing, session issuance, vehicle metadata management and reporting
//! live in external collaborators; this crate is the core they call into.

pub mod engine;
pub mod identity;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payment;
pub mod wal;
