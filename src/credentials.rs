//! Durable storage for the access and refresh tokens.
//!
//! The store is a plain key-value interface so that hosts can plug in
//! whatever persistence they have. Two implementations are provided:
//! * [`MemoryStore`] for tests and short-lived processes
//! * [`FileStore`], a TOML file that survives restarts
//!
//! Keep credential files private: they grant access to the account. On Unix
//! the file store creates them readable by the owner only.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    error::{Error, Result},
    protocol::auth::Tokens,
};

/// Key under which the access token is stored.
pub const ACCESS_TOKEN: &str = "accessToken";

/// Key under which the refresh token is stored.
pub const REFRESH_TOKEN: &str = "refreshToken";

/// Key-value storage for credentials.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// # Errors
    ///
    /// Will return `Err` if the value could not be persisted.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// # Errors
    ///
    /// Will return `Err` if the removal could not be persisted.
    fn remove(&self, key: &str) -> Result<()>;

    /// Removes both tokens.
    ///
    /// # Errors
    ///
    /// Will return `Err` if either removal could not be persisted.
    fn clear(&self) -> Result<()> {
        self.remove(ACCESS_TOKEN)?;
        self.remove(REFRESH_TOKEN)
    }
}

/// Stores freshly issued tokens. A missing refresh token leaves the stored
/// one in place, since not every server rotates it.
///
/// # Errors
///
/// Will return `Err` if either token could not be persisted.
pub fn save_tokens(store: &dyn CredentialStore, tokens: &Tokens) -> Result<()> {
    store.set(ACCESS_TOKEN, &tokens.access_token)?;
    if let Some(refresh_token) = tokens.refresh_token.as_deref() {
        store.set(REFRESH_TOKEN, refresh_token)?;
    }
    Ok(())
}

/// Locks a mutex, recovering the data of a poisoned lock. The maps guarded
/// here are never left half-updated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds the given tokens.
    #[must_use]
    pub fn with_tokens(access_token: &str, refresh_token: Option<&str>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(ACCESS_TOKEN.to_owned(), access_token.to_owned());
        if let Some(refresh_token) = refresh_token {
            entries.insert(REFRESH_TOKEN.to_owned(), refresh_token.to_owned());
        }

        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.entries).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Credential store backed by a TOML file.
///
/// The file is read once on open and rewritten on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Credential files hold two tokens; refuse anything much larger.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Opens a credential file. A missing file is treated as empty and is
    /// created on the first write.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file exists but is too large, unreadable or
    /// not a TOML table of strings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = match fs::metadata(&path) {
            Ok(attributes) => {
                let file_size = attributes.len();
                if file_size > Self::MAX_FILE_SIZE {
                    return Err(Error::out_of_range(format!(
                        "{} is too large ({file_size} bytes)",
                        path.display()
                    )));
                }

                let contents = fs::read_to_string(&path)?;
                toml::from_str::<BTreeMap<String, String>>(&contents).map_err(|e| {
                    Error::invalid_argument(format!("{} format is invalid: {e}", path.display()))
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist yet", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let contents = toml::to_string(entries)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;

        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_owned(), value.to_owned());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}
