//! Access and refresh token storage.
//!
//! [`Token`] is the value type holding one access/refresh token pair with its
//! absolute expiry. [`TokenStore`] owns the persisted copy: tokens survive
//! process restarts by being written to a small TOML file under stable keys.
//!
//! Mutation only ever happens through [`crate::auth::Authenticator`] on a
//! successful token exchange; everything else reads. Reads and writes are
//! serialized behind one mutex so that concurrent refresh attempts cannot
//! interleave their stores.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSeconds};
use veil::Redact;

use crate::error::Result;

/// One access/refresh token pair with absolute expiry.
///
/// The access token is sent as a bearer credential on every authenticated
/// request; the refresh token outlives it and is exchanged for a new pair
/// when the access token expires.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Redact)]
pub struct Token {
    #[redact]
    pub access_token: String,
    #[redact]
    pub refresh_token: String,
    pub expires_at: SystemTime,
}

impl Token {
    /// Whether the access token has expired at `now`.
    ///
    /// Expiry is inclusive: a token whose expiry equals `now` is expired.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Whether the access token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Remaining validity of the access token.
    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.access_token)
    }
}

/// On-disk representation with the expiry flattened to epoch seconds.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
struct PersistedToken {
    access_token: String,
    refresh_token: String,
    #[serde_as(as = "TimestampSeconds<i64>")]
    expires_at: SystemTime,
}

impl From<&Token> for PersistedToken {
    fn from(token: &Token) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token.expires_at,
        }
    }
}

impl From<PersistedToken> for Token {
    fn from(persisted: PersistedToken) -> Self {
        Self {
            access_token: persisted.access_token,
            refresh_token: persisted.refresh_token,
            expires_at: persisted.expires_at,
        }
    }
}

/// Persistent token storage with single-writer discipline.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    inner: Mutex<Option<Token>>,
}

impl TokenStore {
    /// Opens a store backed by `path`, loading any previously persisted
    /// token pair.
    ///
    /// A missing file is not an error: it means no user has logged in yet.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file exists but cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let token = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let persisted: PersistedToken = toml::from_str(&contents)?;
                Some(persisted.into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            inner: Mutex::new(token),
        })
    }

    /// Creates an empty store that persists to `path` on the first `put`.
    #[must_use]
    pub fn empty(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            inner: Mutex::new(None),
        }
    }

    /// Returns the stored token pair, if any.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the store mutex is poisoned.
    pub fn get(&self) -> Result<Option<Token>> {
        Ok(self.inner.lock()?.clone())
    }

    /// Stores a token pair and persists it.
    ///
    /// The lock is held across the file write so a concurrent `put` cannot
    /// leave memory and disk disagreeing.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file cannot be written.
    pub fn put(&self, token: Token) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let contents = toml::to_string(&PersistedToken::from(&token))?;
        std::fs::write(&self.path, contents)?;
        *guard = Some(token);
        Ok(())
    }

    /// Discards the stored token pair and removes the persisted file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.inner.lock()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(ttl: Duration) -> Token {
        Token {
            access_token: "access".to_owned(),
            refresh_token: "refresh".to_owned(),
            expires_at: SystemTime::now() + ttl,
        }
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = SystemTime::now();
        let token = Token {
            access_token: "access".to_owned(),
            refresh_token: "refresh".to_owned(),
            expires_at: now,
        };
        assert!(token.is_expired_at(now));
        assert!(!token.is_expired_at(now - Duration::from_secs(1)));
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let token = Token {
            access_token: "atzr|secret-access".to_owned(),
            refresh_token: "atzr|secret-refresh".to_owned(),
            expires_at: SystemTime::now(),
        };
        let debugged = format!("{token:?}");
        assert!(!debugged.contains("secret-access"));
        assert!(!debugged.contains("secret-refresh"));
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("vesper-tokens-{}", fastrand::u64(..)));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.toml");

        let store = TokenStore::empty(&path);
        let token = token(Duration::from_secs(3600));
        store.put(token.clone()).unwrap();

        let reloaded = TokenStore::load(&path).unwrap();
        let got = reloaded.get().unwrap().unwrap();
        assert_eq!(got.access_token, token.access_token);
        assert_eq!(got.refresh_token, token.refresh_token);

        // Sub-second precision is dropped on disk.
        let expiry_delta = token
            .expires_at
            .duration_since(got.expires_at)
            .unwrap_or(Duration::ZERO);
        assert!(expiry_delta < Duration::from_secs(1));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn clear_empties_memory_and_disk() {
        let dir = std::env::temp_dir().join(format!("vesper-tokens-{}", fastrand::u64(..)));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.toml");

        let store = TokenStore::empty(&path);
        store.put(token(Duration::from_secs(3600))).unwrap();
        store.clear().unwrap();

        assert!(store.get().unwrap().is_none());
        assert!(!path.exists());

        // Clearing an already empty store is fine.
        store.clear().unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_empty_store() {
        let store = TokenStore::load("/nonexistent/vesper-tokens.toml");
        assert!(store.unwrap().get().unwrap().is_none());
    }
}
