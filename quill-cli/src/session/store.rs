//! Durable session storage.
//!
//! One self-describing JSON document per session under the sessions
//! directory (`<id>.json`, or `<id>.json.enc` when encryption is on).
//! Saves are atomic (temp file + rename) and guarded by a revision-based
//! optimistic concurrency check, so a concurrent reader never observes a
//! partial record and a stale writer never overwrites a newer one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use quill_common::security::{mask_text, Envelope, SecureStore};
use quill_common::{Error, Result};

use super::model::{Session, SessionMeta};

/// Version stamped into every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

const PLAIN_EXT: &str = ".json";
const ENCRYPTED_EXT: &str = ".json.enc";

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    schema_version: u32,
    #[serde(flatten)]
    session: Session,
}

/// File-backed session repository.
pub struct SessionStore {
    dir: PathBuf,
    secure: Option<SecureStore>,
    mask_patterns: Vec<Regex>,
}

impl SessionStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            secure: None,
            mask_patterns: Vec::new(),
        })
    }

    /// Route payloads through the given secure store.
    pub fn with_encryption(mut self, secure: SecureStore) -> Self {
        self.secure = Some(secure);
        self
    }

    /// Mask matching text in persisted copies (the in-memory session is
    /// left untouched).
    pub fn with_masking(mut self, patterns: Vec<Regex>) -> Self {
        self.mask_patterns = patterns;
        self
    }

    /// Whether new saves are written encrypted.
    pub fn encrypted(&self) -> bool {
        self.secure.is_some()
    }

    fn plain_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{PLAIN_EXT}"))
    }

    fn encrypted_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{ENCRYPTED_EXT}"))
    }

    /// Locate the record for `id`, preferring the encrypted file.
    fn find_record(&self, id: &str) -> Option<(PathBuf, bool)> {
        let encrypted = self.encrypted_path(id);
        if encrypted.exists() {
            return Some((encrypted, true));
        }
        let plain = self.plain_path(id);
        plain.exists().then_some((plain, false))
    }

    fn read_record(&self, path: &Path, encrypted: bool) -> Result<Session> {
        let raw = fs::read_to_string(path)?;

        let json = if encrypted {
            let secure = self.secure.as_ref().ok_or_else(|| {
                Error::Decryption("record is encrypted and no key is configured".into())
            })?;
            let envelope: Envelope = serde_json::from_str(&raw)
                .map_err(|_| Error::Decryption("malformed envelope".into()))?;
            let payload = secure.open(&envelope)?;
            String::from_utf8(payload)
                .map_err(|_| Error::Decryption("payload is not valid UTF-8".into()))?
        } else {
            raw
        };

        let record: PersistedSession = serde_json::from_str(&json)?;
        if record.schema_version != SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "unsupported session schema version {}",
                record.schema_version
            )));
        }
        Ok(record.session)
    }

    /// Load a session by id.
    pub fn load(&self, id: &str) -> Result<Session> {
        let (path, encrypted) = self
            .find_record(id)
            .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        self.read_record(&path, encrypted)
    }

    /// Persist a session, bumping its revision on success.
    ///
    /// Fails with [`Error::Conflict`] when the persisted revision no longer
    /// matches the caller's in-memory revision (lost-update race); the
    /// caller must reload and reapply.
    pub fn save(&self, session: &mut Session) -> Result<()> {
        if let Some((path, encrypted)) = self.find_record(&session.id) {
            let persisted = self.read_record(&path, encrypted)?;
            if persisted.revision != session.revision {
                return Err(Error::Conflict(format!(
                    "session {} is at revision {}, caller has {}",
                    session.id, persisted.revision, session.revision
                )));
            }
        }

        let mut record = session.clone();
        record.revision += 1;
        record.updated_at = Utc::now();
        if !self.mask_patterns.is_empty() {
            self.mask_record(&mut record);
        }

        let json = serde_json::to_string_pretty(&PersistedSession {
            schema_version: SCHEMA_VERSION,
            session: record.clone(),
        })?;

        let (payload, path, stale) = if let Some(secure) = &self.secure {
            let envelope = secure.seal(json.as_bytes())?;
            (
                serde_json::to_string_pretty(&envelope)?,
                self.encrypted_path(&session.id),
                self.plain_path(&session.id),
            )
        } else {
            (
                json,
                self.plain_path(&session.id),
                self.encrypted_path(&session.id),
            )
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(payload.as_bytes())?;
        tmp.persist(&path).map_err(|err| Error::Io(err.error))?;

        // A record left behind under the other naming (encryption toggled
        // between runs) would shadow or duplicate this one.
        if stale.exists() {
            let _ = fs::remove_file(stale);
        }

        session.revision = record.revision;
        session.updated_at = record.updated_at;
        tracing::debug!(id = %session.id, revision = session.revision, "Session saved");
        Ok(())
    }

    fn mask_record(&self, record: &mut Session) {
        for message in &mut record.messages {
            let masked = mask_text(&message.content, &self.mask_patterns);
            if masked != message.content {
                *message = message.with_content(masked);
            }
        }
        if let Some(summary) = &record.summary {
            record.summary = Some(mask_text(summary, &self.mask_patterns));
        }
        if let Some(title) = &record.title {
            record.title = Some(mask_text(title, &self.mask_patterns));
        }
    }

    /// List persisted sessions, newest first.
    ///
    /// Records that cannot be read (foreign files, missing key) are
    /// skipped with a warning; listing is best-effort, loading is strict.
    pub fn list(&self) -> Result<Vec<SessionMeta>> {
        let mut sessions = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            let (id, encrypted) = if let Some(id) = name.strip_suffix(ENCRYPTED_EXT) {
                (id, true)
            } else if let Some(id) = name.strip_suffix(PLAIN_EXT) {
                (id, false)
            } else {
                continue;
            };

            match self.read_record(&entry.path(), encrypted) {
                Ok(session) => sessions.push(SessionMeta::describe(&session, encrypted)),
                Err(err) => {
                    tracing::warn!(id = %id, error = %err, "Skipping unreadable session record");
                }
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Delete a persisted session.
    pub fn delete(&self, id: &str) -> Result<()> {
        let (path, _) = self
            .find_record(id)
            .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        fs::remove_file(path)?;
        tracing::debug!(id = %id, "Session deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::Message;
    use quill_common::security::{compile_patterns, default_mask_patterns, generate_key};
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SessionStore) {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions")).unwrap();
        (tmp, store)
    }

    fn sample_session() -> Session {
        let mut session = Session::new("llama3");
        session.messages.push(Message::user("hello", None));
        session.messages.push(Message::assistant("hi there"));
        session.summary = Some("greeting exchange".into());
        session.tags.insert("test".into());
        session
    }

    #[test]
    fn test_save_load_roundtrip_plaintext() {
        let (_tmp, store) = temp_store();
        let mut session = sample_session();

        store.save(&mut session).unwrap();
        assert_eq!(session.revision, 1);

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_save_load_roundtrip_encrypted() {
        let tmp = TempDir::new().unwrap();
        let key = generate_key();
        let store = SessionStore::new(tmp.path())
            .unwrap()
            .with_encryption(SecureStore::new(&key));

        let mut session = sample_session();
        store.save(&mut session).unwrap();

        // The on-disk payload is an envelope, not the conversation.
        let raw = fs::read_to_string(tmp.path().join(format!("{}{ENCRYPTED_EXT}", session.id)))
            .unwrap();
        assert!(raw.contains("chacha20poly1305"));
        assert!(!raw.contains("hello"));

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_load_encrypted_with_wrong_key_fails() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path())
            .unwrap()
            .with_encryption(SecureStore::new(&generate_key()));
        let mut session = sample_session();
        store.save(&mut session).unwrap();

        let other = SessionStore::new(tmp.path())
            .unwrap()
            .with_encryption(SecureStore::new(&generate_key()));
        assert!(matches!(
            other.load(&session.id).unwrap_err(),
            Error::Decryption(_)
        ));
    }

    #[test]
    fn test_load_encrypted_without_key_fails() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path())
            .unwrap()
            .with_encryption(SecureStore::new(&generate_key()));
        let mut session = sample_session();
        store.save(&mut session).unwrap();

        let keyless = SessionStore::new(tmp.path()).unwrap();
        assert!(matches!(
            keyless.load(&session.id).unwrap_err(),
            Error::Decryption(_)
        ));
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (_tmp, store) = temp_store();
        assert!(matches!(
            store.load("missing").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_revision_increments_per_save() {
        let (_tmp, store) = temp_store();
        let mut session = sample_session();

        store.save(&mut session).unwrap();
        store.save(&mut session).unwrap();
        assert_eq!(session.revision, 2);
        assert_eq!(store.load(&session.id).unwrap().revision, 2);
    }

    #[test]
    fn test_stale_revision_conflicts() {
        let (_tmp, store) = temp_store();
        let mut session = sample_session();
        store.save(&mut session).unwrap();

        // Two writers start from the same persisted revision.
        let mut first = store.load(&session.id).unwrap();
        let mut second = store.load(&session.id).unwrap();

        first.messages.push(Message::user("from first", None));
        store.save(&mut first).unwrap();

        second.messages.push(Message::user("from second", None));
        let err = store.save(&mut second).unwrap_err();
        assert!(err.is_conflict());

        // The first writer's data is intact.
        let persisted = store.load(&session.id).unwrap();
        assert!(persisted
            .messages
            .iter()
            .any(|message| message.content == "from first"));
    }

    #[test]
    fn test_list_newest_first_and_delete() {
        let (_tmp, store) = temp_store();
        let mut older = sample_session();
        store.save(&mut older).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut newer = sample_session();
        store.save(&mut newer).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[0].message_count, 2);

        store.delete(&older.id).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(matches!(
            store.delete(&older.id).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_masking_applies_to_persisted_copy_only() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path())
            .unwrap()
            .with_masking(compile_patterns(&default_mask_patterns()));

        let mut session = Session::new("llama3");
        session
            .messages
            .push(Message::user("key: sk-abcdefghijklmnopqrstuv", None));
        store.save(&mut session).unwrap();

        // In-memory content untouched.
        assert!(session.messages[0].content.contains("sk-"));

        let loaded = store.load(&session.id).unwrap();
        assert!(loaded.messages[0].content.contains("[REDACTED]"));
        assert!(!loaded.messages[0].content.contains("sk-abcdefghijklmnopqrstuv"));
    }

    #[test]
    fn test_list_skips_foreign_files() {
        let (tmp, store) = temp_store();
        let _ = tmp; // sessions dir lives inside
        fs::write(store.dir.join("notes.txt"), "not a session").unwrap();
        fs::write(store.dir.join("broken.json"), "{").unwrap();

        assert!(store.list().unwrap().is_empty());
    }
}
