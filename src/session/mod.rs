//! Guest-side referral capture. A guest holds at most one [`ReferralToken`],
//! handed out once through the atomic [`SessionStorage::take`].

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::identity::{Address, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session storage io: {0}")]
    Io(#[from] io::Error),
    #[error("session token encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("session storage lock poisoned")]
    Poisoned,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralToken {
    pub scout: Address,
    pub captured_at: Timestamp,
}

impl ReferralToken {
    pub fn age(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.captured_at)
    }

    pub fn is_expired(&self, now: Timestamp, horizon_secs: u64) -> bool {
        self.age(now) >= horizon_secs
    }
}

pub trait SessionStorage: Send + Sync {
    fn load(&self) -> Result<Option<ReferralToken>, SessionError>;

    fn store(&self, token: &ReferralToken) -> Result<(), SessionError>;

    fn clear(&self) -> Result<(), SessionError>;

    /// Clears the slot only while it still holds `expected`.
    fn clear_if(&self, expected: &ReferralToken) -> Result<bool, SessionError>;

    /// Removes the token and returns it in one step.
    fn take(&self) -> Result<Option<ReferralToken>, SessionError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    slot: Mutex<Option<ReferralToken>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn load(&self) -> Result<Option<ReferralToken>, SessionError> {
        let slot = self.slot.lock().map_err(|_| SessionError::Poisoned)?;
        Ok(slot.clone())
    }

    fn store(&self, token: &ReferralToken) -> Result<(), SessionError> {
        let mut slot = self.slot.lock().map_err(|_| SessionError::Poisoned)?;
        *slot = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        let mut slot = self.slot.lock().map_err(|_| SessionError::Poisoned)?;
        *slot = None;
        Ok(())
    }

    fn clear_if(&self, expected: &ReferralToken) -> Result<bool, SessionError> {
        let mut slot = self.slot.lock().map_err(|_| SessionError::Poisoned)?;
        if slot.as_ref() != Some(expected) {
            return Ok(false);
        }
        *slot = None;
        Ok(true)
    }

    fn take(&self) -> Result<Option<ReferralToken>, SessionError> {
        let mut slot = self.slot.lock().map_err(|_| SessionError::Poisoned)?;
        Ok(slot.take())
    }
}

/// Token persisted as a JSON file, for command-line sessions.
///
/// `take` renames the file to a random claim name before reading it. Rename
/// is atomic on one filesystem, so of two concurrent consumers exactly one
/// finds the file. `clear_if` claims the same way and links a non-matching
/// token back only if no newer one was stored meanwhile.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, tag: &str) -> PathBuf {
        let mut suffix = [0u8; 8];
        OsRng.fill_bytes(&mut suffix);
        let name = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("session");
        self.path
            .with_file_name(format!("{name}.{tag}-{}", hex::encode(suffix)))
    }

    /// Moves the token file aside under a unique name; `None` if absent.
    fn claim(&self) -> Result<Option<PathBuf>, SessionError> {
        let claim = self.sibling("claim");
        match fs::rename(&self.path, &claim) {
            Ok(()) => Ok(Some(claim)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Option<ReferralToken> {
        match serde_json::from_slice(bytes) {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "discarding unreadable session token");
                None
            }
        }
    }
}

impl SessionStorage for FileSessionStorage {
    fn load(&self) -> Result<Option<ReferralToken>, SessionError> {
        match fs::read(&self.path) {
            Ok(bytes) => match self.decode(&bytes) {
                Some(token) => Ok(Some(token)),
                None => {
                    self.clear()?;
                    Ok(None)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, token: &ReferralToken) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.sibling("tmp");
        fs::write(&tmp, serde_json::to_vec(token)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn clear_if(&self, expected: &ReferralToken) -> Result<bool, SessionError> {
        let Some(claim) = self.claim()? else {
            return Ok(false);
        };
        let bytes = fs::read(&claim)?;
        let matches = self.decode(&bytes).as_ref() == Some(expected);
        if !matches {
            match fs::hard_link(&claim, &self.path) {
                Ok(()) => {}
                // a capture landed in between and wins
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        fs::remove_file(&claim)?;
        Ok(matches)
    }

    fn take(&self) -> Result<Option<ReferralToken>, SessionError> {
        let Some(claim) = self.claim()? else {
            return Ok(None);
        };
        let bytes = fs::read(&claim)?;
        fs::remove_file(&claim)?;
        Ok(self.decode(&bytes))
    }
}

pub struct ScoutSessionStore<S> {
    storage: S,
    horizon_secs: u64,
}

impl<S: SessionStorage> ScoutSessionStore<S> {
    pub fn new(storage: S, horizon_secs: u64) -> Self {
        Self {
            storage,
            horizon_secs,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Authenticated visitors drop any stored token and capture nothing;
    /// malformed identifiers leave the stored token as it was.
    pub fn capture(
        &self,
        candidate: Option<&str>,
        current_identity: Option<&Address>,
        now: Timestamp,
    ) -> Result<Option<ReferralToken>, SessionError> {
        if let Some(identity) = current_identity {
            debug!(%identity, "authenticated visitor, dropping referral token");
            self.storage.clear()?;
            return Ok(None);
        }
        let Some(raw) = candidate else {
            return Ok(None);
        };
        let scout = match Address::parse(raw) {
            Ok(scout) => scout,
            Err(err) => {
                debug!(candidate = raw, %err, "ignoring malformed scout identifier");
                return Ok(None);
            }
        };
        let token = ReferralToken {
            scout,
            captured_at: now,
        };
        self.storage.store(&token)?;
        debug!(scout = %token.scout, "referral captured");
        Ok(Some(token))
    }

    pub fn peek_or_restore(&self, now: Timestamp) -> Result<Option<ReferralToken>, SessionError> {
        match self.storage.load()? {
            Some(token) if token.is_expired(now, self.horizon_secs) => {
                // a fresh capture stored after the load must survive the purge
                if self.storage.clear_if(&token)? {
                    debug!(scout = %token.scout, "expired referral token purged");
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn consume_once(&self, now: Timestamp) -> Result<Option<ReferralToken>, SessionError> {
        Ok(self
            .storage
            .take()?
            .filter(|token| !token.is_expired(now, self.horizon_secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DAY_SECS;
    use std::{sync::Barrier, thread};

    const HORIZON: u64 = 30 * DAY_SECS;

    fn memory_store() -> ScoutSessionStore<MemorySessionStorage> {
        ScoutSessionStore::new(MemorySessionStorage::new(), HORIZON)
    }

    #[test]
    fn consume_is_single_use() {
        let store = memory_store();
        let token = store.capture(Some("0x5c"), None, 100).unwrap().unwrap();
        assert_eq!(store.consume_once(101).unwrap(), Some(token));
        assert_eq!(store.consume_once(102).unwrap(), None);

        store.capture(Some("0x5d"), None, 103).unwrap();
        assert!(store.consume_once(104).unwrap().is_some());
    }

    #[test]
    fn authenticated_visitor_drops_existing_token() {
        let store = memory_store();
        store.capture(Some("0x5c"), None, 100).unwrap();
        let me = Address::parse("0x77").unwrap();
        assert_eq!(store.capture(Some("0x5d"), Some(&me), 101).unwrap(), None);
        assert_eq!(store.peek_or_restore(102).unwrap(), None);
    }

    #[test]
    fn malformed_identifier_keeps_previous_token() {
        let store = memory_store();
        let first = store.capture(Some("0x5c"), None, 100).unwrap();
        assert_eq!(store.capture(Some("not-a-scout"), None, 101).unwrap(), None);
        assert_eq!(store.peek_or_restore(102).unwrap(), first);
    }

    #[test]
    fn new_capture_overwrites_instead_of_extending() {
        let store = memory_store();
        store.capture(Some("0x5c"), None, 100).unwrap();
        store.capture(Some("0x5d"), None, 200).unwrap();
        let token = store.peek_or_restore(201).unwrap().unwrap();
        assert_eq!(token.scout, Address::parse("0x5d").unwrap());
        assert_eq!(token.captured_at, 200);
    }

    #[test]
    fn expired_token_is_purged_on_peek() {
        let store = memory_store();
        store.capture(Some("0x5c"), None, 0).unwrap();
        assert!(store.peek_or_restore(HORIZON - 1).unwrap().is_some());
        assert_eq!(store.peek_or_restore(HORIZON).unwrap(), None);
        assert_eq!(store.storage().load().unwrap(), None);
    }

    #[test]
    fn purge_leaves_a_newer_token_alone() {
        let stale = ReferralToken {
            scout: Address::parse("0x5c").unwrap(),
            captured_at: 0,
        };
        let fresh = ReferralToken {
            scout: Address::parse("0x5d").unwrap(),
            captured_at: HORIZON,
        };
        let dir = tempfile::tempdir().unwrap();
        let file = FileSessionStorage::new(dir.path().join("session.json"));
        let memory = MemorySessionStorage::new();
        for storage in [&file as &dyn SessionStorage, &memory] {
            storage.store(&fresh).unwrap();
            assert!(!storage.clear_if(&stale).unwrap());
            assert_eq!(storage.load().unwrap(), Some(fresh.clone()));
            assert!(storage.clear_if(&fresh).unwrap());
            assert_eq!(storage.load().unwrap(), None);
            assert!(!storage.clear_if(&fresh).unwrap());
        }
    }

    fn race_consumers<S: SessionStorage>(store: &ScoutSessionStore<S>) {
        const RACERS: usize = 8;
        let token = store.capture(Some("0x5c"), None, 100).unwrap().unwrap();
        let barrier = Barrier::new(RACERS);
        let won: Vec<ReferralToken> = thread::scope(|scope| {
            let racers: Vec<_> = (0..RACERS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        store.consume_once(101).unwrap()
                    })
                })
                .collect();
            racers
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(won, vec![token]);
        assert_eq!(store.storage().load().unwrap(), None);
    }

    #[test]
    fn concurrent_consumers_share_one_memory_token() {
        let store = memory_store();
        for _ in 0..20 {
            race_consumers(&store);
        }
    }

    #[test]
    fn concurrent_consumers_share_one_file_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScoutSessionStore::new(
            FileSessionStorage::new(dir.path().join("session.json")),
            HORIZON,
        );
        for _ in 0..20 {
            race_consumers(&store);
        }
        // no claim files are left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn expired_token_is_not_consumable() {
        let store = memory_store();
        store.capture(Some("0x5c"), None, 0).unwrap();
        assert_eq!(store.consume_once(HORIZON + 5).unwrap(), None);
        assert_eq!(store.storage().load().unwrap(), None);
    }

    #[test]
    fn file_storage_take_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScoutSessionStore::new(
            FileSessionStorage::new(dir.path().join("session.json")),
            HORIZON,
        );
        store.capture(Some("0x5c"), None, 10).unwrap();
        assert!(store.peek_or_restore(11).unwrap().is_some());
        assert!(store.consume_once(12).unwrap().is_some());
        assert_eq!(store.consume_once(13).unwrap(), None);
        assert!(!store.storage().path().exists());
    }

    #[test]
    fn file_storage_discards_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{ not json").unwrap();
        let storage = FileSessionStorage::new(&path);
        assert_eq!(storage.load().unwrap(), None);
        assert!(!path.exists());
    }
}
