use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::models::{CredentialRecord, Role, User};

use super::storage::{CredentialStorage, StorageError, TOKEN_KEY, USER_KEY};
use super::token::{decode_claims, Clock};

/// Tokens expiring within this many seconds are no longer sent.
/// Keeps a request from going out with a token that expires mid-flight.
pub const DEFAULT_VALIDITY_MARGIN_SECS: i64 = 300;

/// Tokens expiring within this many seconds are renewed proactively.
pub const DEFAULT_RENEWAL_WINDOW_SECS: i64 = 1800;

/// When a held token is considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub validity_margin_secs: i64,
    pub renewal_window_secs: i64,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            validity_margin_secs: DEFAULT_VALIDITY_MARGIN_SECS,
            renewal_window_secs: DEFAULT_RENEWAL_WINDOW_SECS,
        }
    }
}

/// Result of a conditional replacement made on behalf of a renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    /// The expected token was still held and has been replaced.
    Replaced,
    /// A different record was stored in the meantime (fresh login); it is kept.
    Superseded(CredentialRecord),
    /// The store was emptied in the meantime (logout); nothing was written.
    Vacated,
}

/// Single source of truth for the logged-in identity.
///
/// Constructed once at startup and shared by `Arc`. Every read and write of
/// the two storage keys happens under one lock, so a reader never pairs a
/// token from one record with a user from another.
pub struct SessionStore {
    storage: Box<dyn CredentialStorage>,
    clock: Arc<dyn Clock>,
    policy: ExpiryPolicy,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(
        storage: Box<dyn CredentialStorage>,
        clock: Arc<dyn Clock>,
        policy: ExpiryPolicy,
    ) -> Self {
        Self {
            storage,
            clock,
            policy,
            lock: Mutex::new(()),
        }
    }

    /// Current credential record, or `None` when logged out.
    ///
    /// A missing key, an unparseable user, or an undecodable token all read
    /// as logged out.
    pub fn get(&self) -> Option<CredentialRecord> {
        let _guard = self.guard();
        self.load_record()
    }

    /// Store a record, replacing token and user together.
    pub fn set(&self, record: &CredentialRecord) -> Result<(), StorageError> {
        let _guard = self.guard();
        self.write_record(record)
    }

    /// Remove the record. Clearing an empty store is a no-op.
    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.guard();
        self.storage.remove(&[TOKEN_KEY, USER_KEY])
    }

    /// Replace the record only if `expected_token` is still the one held.
    pub fn replace_if_current(
        &self,
        expected_token: &str,
        record: &CredentialRecord,
    ) -> Result<Replacement, StorageError> {
        let _guard = self.guard();
        match self.load_record() {
            Some(current) if current.access_token == expected_token => {
                self.write_record(record)?;
                Ok(Replacement::Replaced)
            }
            Some(current) => Ok(Replacement::Superseded(current)),
            None => Ok(Replacement::Vacated),
        }
    }

    /// Clear the record only if `expected_token` is still the one held,
    /// or if what is held is not a usable record. Returns whether it cleared.
    pub fn clear_if_current(&self, expected_token: &str) -> Result<bool, StorageError> {
        let _guard = self.guard();
        match self.load_record() {
            Some(current) if current.access_token != expected_token => Ok(false),
            _ => {
                self.storage.remove(&[TOKEN_KEY, USER_KEY])?;
                Ok(true)
            }
        }
    }

    /// Raw token as stored, whether or not it is still valid
    pub fn token(&self) -> Option<String> {
        self.get().map(|record| record.access_token)
    }

    pub fn user(&self) -> Option<User> {
        self.get().map(|record| record.user)
    }

    pub fn role(&self) -> Option<Role> {
        self.get().map(|record| record.user.role)
    }

    /// Whether `token` (or the stored token when `None`) can still be sent:
    /// it decodes and does not expire within the validity margin.
    pub fn is_valid(&self, token: Option<&str>) -> bool {
        match self.remaining_secs(token) {
            Some(remaining) => remaining > self.policy.validity_margin_secs,
            None => false,
        }
    }

    /// Whether `token` (or the stored token when `None`) is still valid but
    /// close enough to expiry that it should be renewed in the background.
    pub fn should_renew(&self, token: Option<&str>) -> bool {
        match self.remaining_secs(token) {
            Some(remaining) => {
                remaining > self.policy.validity_margin_secs
                    && remaining < self.policy.renewal_window_secs
            }
            None => false,
        }
    }

    /// A full record is held and its token is valid.
    pub fn is_authenticated(&self) -> bool {
        match self.get() {
            Some(record) => self.is_valid(Some(&record.access_token)),
            None => false,
        }
    }

    /// Seconds until the stored token expires, if one is held
    pub fn seconds_until_expiry(&self) -> Option<i64> {
        self.remaining_secs(None)
    }

    fn remaining_secs(&self, token: Option<&str>) -> Option<i64> {
        let claims = match token {
            Some(token) => decode_claims(token)?,
            None => decode_claims(&self.token()?)?,
        };
        Some(claims.exp - self.clock.now())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Callers hold the guard
    fn load_record(&self) -> Option<CredentialRecord> {
        let token = self.read_key(TOKEN_KEY)?;
        let user_json = self.read_key(USER_KEY)?;

        let user: User = match serde_json::from_str(&user_json) {
            Ok(user) => user,
            Err(e) => {
                debug!(error = %e, "Stored user is not valid JSON, treating as logged out");
                return None;
            }
        };

        if decode_claims(&token).is_none() {
            debug!("Stored token does not decode, treating as logged out");
            return None;
        }

        Some(CredentialRecord::new(token, user))
    }

    fn read_key(&self, key: &str) -> Option<String> {
        match self.storage.read(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read credential storage");
                None
            }
        }
    }

    fn write_record(&self, record: &CredentialRecord) -> Result<(), StorageError> {
        let user_json = serde_json::to_string(&record.user)?;
        self.storage
            .write(&[(TOKEN_KEY, record.access_token.as_str()), (USER_KEY, user_json.as_str())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryStorage;
    use crate::auth::token::ManualClock;
    use crate::test_support::{mint_token, patient, START};

    fn store_with_clock() -> (SessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = SessionStore::new(
            Box::new(MemoryStorage::new()),
            clock.clone(),
            ExpiryPolicy::default(),
        );
        (store, clock)
    }

    fn record_expiring_in(secs: i64) -> CredentialRecord {
        CredentialRecord::new(mint_token("1", "a@b.com", "patient", START + secs), patient())
    }

    #[test]
    fn test_set_then_get() {
        let (store, _) = store_with_clock();
        assert!(store.get().is_none());

        let record = record_expiring_in(3600);
        store.set(&record).unwrap();
        assert_eq!(store.get(), Some(record.clone()));
        assert_eq!(store.token(), Some(record.access_token));
        assert_eq!(store.role(), Some(Role::Patient));
        assert!(store.is_authenticated());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (store, _) = store_with_clock();
        store.clear().unwrap();
        assert!(!store.is_authenticated());

        store.set(&record_expiring_in(3600)).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.get().is_none());
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_validity_and_renewal_margins() {
        let (store, _) = store_with_clock();

        let t200 = mint_token("1", "a@b.com", "patient", START + 200);
        let t300 = mint_token("1", "a@b.com", "patient", START + 300);
        let t301 = mint_token("1", "a@b.com", "patient", START + 301);
        let t1000 = mint_token("1", "a@b.com", "patient", START + 1000);
        let t1800 = mint_token("1", "a@b.com", "patient", START + 1800);
        let t1801 = mint_token("1", "a@b.com", "patient", START + 1801);

        assert!(!store.is_valid(Some(&t200)));
        assert!(!store.is_valid(Some(&t300)));
        assert!(store.is_valid(Some(&t301)));

        assert!(store.is_valid(Some(&t1000)));
        assert!(store.should_renew(Some(&t1000)));

        assert!(!store.should_renew(Some(&t1800)));
        assert!(!store.should_renew(Some(&t1801)));
        assert!(store.is_valid(Some(&t1801)));

        // Already inside the validity margin is the reactive path's job
        assert!(!store.should_renew(Some(&t200)));
    }

    #[test]
    fn test_predicates_fall_back_to_stored_token() {
        let (store, clock) = store_with_clock();
        assert!(!store.is_valid(None));
        assert!(!store.should_renew(None));

        store.set(&record_expiring_in(3600)).unwrap();
        assert!(store.is_valid(None));
        assert!(!store.should_renew(None));

        clock.advance(2000);
        assert!(store.should_renew(None));

        clock.advance(1400);
        assert!(!store.is_valid(None));
        assert!(!store.is_authenticated());
        // Still held, just not usable
        assert!(store.get().is_some());
        assert_eq!(store.seconds_until_expiry(), Some(200));
    }

    #[test]
    fn test_malformed_storage_reads_as_logged_out() {
        let storage = MemoryStorage::new();
        let token = mint_token("1", "a@b.com", "patient", START + 3600);
        storage.write(&[(TOKEN_KEY, token.as_str()), (USER_KEY, "{broken")]).unwrap();
        let store = SessionStore::new(
            Box::new(storage),
            Arc::new(ManualClock::new(START)),
            ExpiryPolicy::default(),
        );
        assert!(store.get().is_none());
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_partial_record_reads_as_logged_out() {
        let storage = MemoryStorage::new();
        let token = mint_token("1", "a@b.com", "patient", START + 3600);
        storage.write(&[(TOKEN_KEY, token.as_str())]).unwrap();
        let store = SessionStore::new(
            Box::new(storage),
            Arc::new(ManualClock::new(START)),
            ExpiryPolicy::default(),
        );
        assert!(store.get().is_none());
        assert!(store.token().is_none());
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_undecodable_token_reads_as_logged_out() {
        let (store, _) = store_with_clock();
        store.set(&CredentialRecord::new("garbage", patient())).unwrap();
        assert!(store.get().is_none());
        assert!(!store.is_valid(None));
        assert!(!store.is_valid(Some("garbage")));

        // Clearing the leftovers still works
        assert!(store.clear_if_current("anything").unwrap());
    }

    #[test]
    fn test_replace_if_current() {
        let (store, _) = store_with_clock();
        let first = record_expiring_in(3600);
        let second = record_expiring_in(7200);
        store.set(&first).unwrap();

        assert_eq!(
            store.replace_if_current(&first.access_token, &second).unwrap(),
            Replacement::Replaced
        );
        assert_eq!(store.get(), Some(second.clone()));

        // A renewal that started from `first` must not clobber `second`
        let late = record_expiring_in(5000);
        assert_eq!(
            store.replace_if_current(&first.access_token, &late).unwrap(),
            Replacement::Superseded(second.clone())
        );
        assert_eq!(store.get(), Some(second));

        store.clear().unwrap();
        assert_eq!(
            store.replace_if_current(&first.access_token, &late).unwrap(),
            Replacement::Vacated
        );
        assert!(store.get().is_none());
    }

    #[test]
    fn test_clear_if_current() {
        let (store, _) = store_with_clock();
        let first = record_expiring_in(3600);
        let second = record_expiring_in(7200);
        store.set(&second).unwrap();

        assert!(!store.clear_if_current(&first.access_token).unwrap());
        assert!(store.get().is_some());

        assert!(store.clear_if_current(&second.access_token).unwrap());
        assert!(store.get().is_none());
    }

    #[test]
    fn test_replacement_is_atomic_for_readers() {
        let (store, _) = store_with_clock();
        let store = Arc::new(store);

        let a = CredentialRecord::new(
            mint_token("1", "a@b.com", "patient", START + 3600),
            User::new("1", "a@b.com", "Ada", Role::Patient),
        );
        let b = CredentialRecord::new(
            mint_token("2", "b@b.com", "doctor", START + 7200),
            User::new("2", "b@b.com", "Bea", Role::Doctor),
        );
        store.set(&a).unwrap();

        let writer = {
            let store = Arc::clone(&store);
            let (a, b) = (a.clone(), b.clone());
            std::thread::spawn(move || {
                for i in 0..500 {
                    let next = if i % 2 == 0 { &b } else { &a };
                    store.set(next).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let (a, b) = (a.clone(), b.clone());
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let record = store.get().expect("record is always present");
                        assert!(record == a || record == b, "observed a mixed record");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
