use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::CustomerSnapshot;

/// Guest identities provisioned by contact email for callers with no session.
/// The identity collaborator owns real accounts; the engine only needs a
/// stable customer id per email so repeat guests collapse onto one identity.
/// Rebuilt from the reservation ledger on replay — no events of its own.
pub struct GuestDirectory {
    by_email: DashMap<String, CustomerSnapshot>,
}

impl Default for GuestDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestDirectory {
    pub fn new() -> Self {
        Self {
            by_email: DashMap::new(),
        }
    }

    /// Normalize an email for keying: trimmed, lowercased.
    fn key(email: &str) -> String {
        email.trim().to_ascii_lowercase()
    }

    /// Find or lazily provision a guest identity for the given contact.
    /// Name/phone on an existing identity are left as first captured; the
    /// reservation carries its own contact snapshot.
    pub fn find_or_provision(
        &self,
        name: &str,
        email: &str,
        phone: Option<&str>,
    ) -> std::io::Result<CustomerSnapshot> {
        let key = Self::key(email);
        if key.is_empty() || key.len() > MAX_EMAIL_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid guest email",
            ));
        }
        if let Some(existing) = self.by_email.get(&key) {
            return Ok(existing.value().clone());
        }
        if self.by_email.len() >= MAX_GUESTS {
            return Err(std::io::Error::other("too many guest identities"));
        }

        let snapshot = CustomerSnapshot {
            id: Ulid::new(),
            name: name.to_string(),
            email: key.clone(),
            phone: phone.map(str::to_string),
            guest: true,
        };
        // Entry API closes the provision race: first writer wins.
        let entry = self.by_email.entry(key).or_insert_with(|| snapshot);
        metrics::counter!(crate::observability::GUESTS_PROVISIONED_TOTAL).increment(1);
        Ok(entry.value().clone())
    }

    /// Re-seed from a replayed reservation's customer snapshot.
    pub fn restore(&self, snapshot: &CustomerSnapshot) {
        if snapshot.guest {
            self.by_email
                .entry(Self::key(&snapshot.email))
                .or_insert_with(|| snapshot.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}
