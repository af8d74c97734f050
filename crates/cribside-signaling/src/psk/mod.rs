use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use directories::BaseDirs;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub mod import;

pub use import::{FileImportChannel, FragmentParams, ImportChannel};

/// Shortest secret we accept, decoded.
pub const MIN_KEY_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("key store error: {0}")]
    Store(String),
    #[error("unable to determine home directory")]
    NoHomeDir,
    #[error("invalid pairing token")]
    InvalidToken,
}

impl From<toml::de::Error> for KeyError {
    fn from(value: toml::de::Error) -> Self {
        KeyError::Store(value.to_string())
    }
}

impl From<toml::ser::Error> for KeyError {
    fn from(value: toml::ser::Error) -> Self {
        KeyError::Store(value.to_string())
    }
}

/// Which side of the pairing this process plays. The sender (camera) may
/// mint a key for a room; a receiver must import one out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Sender,
    Receiver,
}

/// The per-room shared secret, decoded. Lent read-only to the transport
/// for the lifetime of a session; never serialized and never transmitted.
#[derive(Clone)]
pub struct SharedKey {
    room: String,
    bytes: Vec<u8>,
}

impl SharedKey {
    pub fn from_bytes(room: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            room: room.into(),
            bytes,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("room", &self.room)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Outcome of [`KeyStore::require_key`]. `NeedsPairing` is a signal to
/// the caller; the navigation side effect (opening the pairing page)
/// belongs to whoever drives the UI.
#[derive(Debug)]
pub enum KeyDecision {
    Ready { key: SharedKey },
    NeedsPairing { room: String, intent: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub token_b64u: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreFile {
    #[serde(default)]
    last_room: Option<String>,
    #[serde(default)]
    rooms: HashMap<String, KeyRecord>,
}

/// File-backed store of per-room shared keys, one TOML document under
/// the user's home directory.
pub struct KeyStore {
    path: PathBuf,
    file: StoreFile,
}

impl KeyStore {
    pub fn default_path() -> Result<PathBuf, KeyError> {
        let base = BaseDirs::new().ok_or(KeyError::NoHomeDir)?;
        Ok(base.home_dir().join(".cribside").join("keys.toml"))
    }

    pub fn open() -> Result<Self, KeyError> {
        Self::open_at(Self::default_path()?)
    }

    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let path = path.into();
        let file = if path.exists() {
            toml::from_str(&fs::read_to_string(&path)?)?
        } else {
            StoreFile::default()
        };
        Ok(Self { path, file })
    }

    fn save(&self) -> Result<(), KeyError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = toml::to_string_pretty(&self.file)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The valid key for a room, if one is stored. Records whose token
    /// decodes to fewer than [`MIN_KEY_BYTES`] are treated as absent.
    pub fn key_for(&self, room: &str) -> Option<SharedKey> {
        let record = self.file.rooms.get(room)?;
        let bytes = decode_token(&record.token_b64u)?;
        Some(SharedKey::from_bytes(room, bytes))
    }

    /// Ensure a key exists for the room. The sender role mints and
    /// persists 16 random bytes when none is stored; the receiver role
    /// never fabricates one.
    pub fn ensure_key(&mut self, room: &str, role: KeyRole) -> Result<Option<SharedKey>, KeyError> {
        if let Some(key) = self.key_for(room) {
            return Ok(Some(key));
        }
        if role != KeyRole::Sender {
            return Ok(None);
        }
        let mut bytes = [0u8; MIN_KEY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        self.file.rooms.insert(
            room.to_string(),
            KeyRecord {
                token_b64u: BASE64_URL.encode(bytes),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        self.save()?;
        tracing::info!(target: "psk", room, "created shared key");
        Ok(Some(SharedKey::from_bytes(room, bytes.to_vec())))
    }

    /// Import a key from a one-time out-of-band channel, then scrub the
    /// channel so the same token cannot be imported twice. Returns the
    /// room the key was stored under, or `None` when the channel carried
    /// no token. An invalid token is an error and leaves the channel
    /// intact.
    pub fn import(
        &mut self,
        channel: &mut dyn ImportChannel,
        default_room: &str,
    ) -> Result<Option<String>, KeyError> {
        let Some(params) = channel.read() else {
            return Ok(None);
        };
        let Some(token) = params.token else {
            return Ok(None);
        };
        if decode_token(&token).is_none() {
            return Err(KeyError::InvalidToken);
        }
        let room = params
            .room
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| default_room.to_string());
        self.file.rooms.insert(
            room.clone(),
            KeyRecord {
                token_b64u: token,
                created_at: OffsetDateTime::now_utc(),
            },
        );
        self.save()?;
        channel.scrub();
        tracing::info!(target: "psk", room = %room, "imported shared key");
        Ok(Some(room))
    }

    /// Resolve a room (preferred, then last-used, then fallback) and
    /// require a valid key for it. If that room has none but exactly one
    /// other room does, that room is used instead. Never fabricates a
    /// key; a consuming caller gets `NeedsPairing` back.
    pub fn require_key(
        &mut self,
        intent: &str,
        prefer_room: Option<&str>,
        fallback_room: &str,
    ) -> Result<KeyDecision, KeyError> {
        let room = self.choose_room(prefer_room, fallback_room);
        if let Some(key) = self.key_for(&room) {
            self.remember_room(&room)?;
            return Ok(KeyDecision::Ready { key });
        }
        let rooms = self.valid_rooms();
        if rooms.len() == 1 {
            let only = rooms.into_iter().next().unwrap();
            if let Some(key) = self.key_for(&only) {
                self.remember_room(&only)?;
                return Ok(KeyDecision::Ready { key });
            }
        }
        Ok(KeyDecision::NeedsPairing {
            room,
            intent: intent.to_string(),
        })
    }

    /// Rooms holding a valid key, sorted.
    pub fn valid_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .file
            .rooms
            .iter()
            .filter(|(_, record)| decode_token(&record.token_b64u).is_some())
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    /// The `room=…&token=…` fragment for the out-of-band pairing channel.
    pub fn share_fragment(&self, room: &str) -> Option<String> {
        let record = self.file.rooms.get(room)?;
        decode_token(&record.token_b64u)?;
        let mut fragment = url::form_urlencoded::Serializer::new(String::new());
        fragment.append_pair("room", room);
        fragment.append_pair("token", &record.token_b64u);
        Some(fragment.finish())
    }

    fn choose_room(&self, prefer: Option<&str>, fallback: &str) -> String {
        if let Some(room) = prefer {
            let trimmed = room.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        if let Some(last) = &self.file.last_room {
            if !last.is_empty() {
                return last.clone();
            }
        }
        fallback.to_string()
    }

    fn remember_room(&mut self, room: &str) -> Result<(), KeyError> {
        if self.file.last_room.as_deref() != Some(room) {
            self.file.last_room = Some(room.to_string());
            self.save()?;
        }
        Ok(())
    }
}

/// Decode a URL-safe base64 token; `None` unless it holds at least
/// [`MIN_KEY_BYTES`] bytes.
pub fn decode_token(token_b64u: &str) -> Option<Vec<u8>> {
    let bytes = BASE64_URL.decode(token_b64u.as_bytes()).ok()?;
    if bytes.len() < MIN_KEY_BYTES {
        return None;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> KeyStore {
        let path = std::env::temp_dir()
            .join("cribside-tests")
            .join(format!("{}.toml", uuid::Uuid::new_v4()));
        KeyStore::open_at(path).unwrap()
    }

    #[test]
    fn sender_mints_key_when_absent() {
        let mut store = temp_store();
        let key = store.ensure_key("Baby", KeyRole::Sender).unwrap().unwrap();
        assert_eq!(key.bytes().len(), MIN_KEY_BYTES);
        // Stable across calls.
        let again = store.ensure_key("Baby", KeyRole::Sender).unwrap().unwrap();
        assert_eq!(key.bytes(), again.bytes());
    }

    #[test]
    fn receiver_never_mints() {
        let mut store = temp_store();
        assert!(store.ensure_key("Baby", KeyRole::Receiver).unwrap().is_none());
        assert!(store.valid_rooms().is_empty());
    }

    #[test]
    fn short_token_is_treated_as_absent() {
        let mut store = temp_store();
        store.file.rooms.insert(
            "Baby".into(),
            KeyRecord {
                token_b64u: BASE64_URL.encode(b"short"),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        assert!(store.key_for("Baby").is_none());
        assert!(store.valid_rooms().is_empty());
    }

    #[test]
    fn require_key_falls_back_to_the_single_other_room() {
        let mut store = temp_store();
        store.ensure_key("Nursery", KeyRole::Sender).unwrap();
        match store.require_key("viewer", Some("Baby"), "Baby").unwrap() {
            KeyDecision::Ready { key } => assert_eq!(key.room(), "Nursery"),
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[test]
    fn require_key_signals_pairing_when_ambiguous() {
        let mut store = temp_store();
        store.ensure_key("Nursery", KeyRole::Sender).unwrap();
        store.ensure_key("Den", KeyRole::Sender).unwrap();
        match store.require_key("viewer", Some("Baby"), "Baby").unwrap() {
            KeyDecision::NeedsPairing { room, intent } => {
                assert_eq!(room, "Baby");
                assert_eq!(intent, "viewer");
            }
            other => panic!("expected pairing, got {other:?}"),
        }
    }

    #[test]
    fn last_room_wins_over_fallback() {
        let mut store = temp_store();
        store.ensure_key("Nursery", KeyRole::Sender).unwrap();
        store.ensure_key("Den", KeyRole::Sender).unwrap();
        match store.require_key("viewer", Some("Nursery"), "Baby").unwrap() {
            KeyDecision::Ready { key } => assert_eq!(key.room(), "Nursery"),
            other => panic!("unexpected {other:?}"),
        }
        // No preference this time; the remembered room is used.
        match store.require_key("viewer", None, "Baby").unwrap() {
            KeyDecision::Ready { key } => assert_eq!(key.room(), "Nursery"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn share_fragment_round_trips_through_import() {
        let mut store = temp_store();
        store.ensure_key("Baby", KeyRole::Sender).unwrap();
        let fragment = store.share_fragment("Baby").unwrap();
        let params = FragmentParams::parse(&fragment);
        assert_eq!(params.room.as_deref(), Some("Baby"));
        assert!(params.token.is_some());
    }
}
