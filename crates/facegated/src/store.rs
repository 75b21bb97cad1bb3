use facegate_core::{Descriptor, Enrollment};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: wrong key or corrupted row")]
    DecryptionFailed,
    #[error("invalid descriptor blob of {0} bytes")]
    InvalidBlob(usize),
    #[error("refusing to store an empty or non-finite descriptor")]
    InvalidDescriptor,
    #[error("encryption key {path}: {source}")]
    KeyIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Enrollment metadata, without the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentInfo {
    pub id: String,
    pub user: String,
    pub model_version: Option<String>,
    pub active: bool,
    pub enrolled_at: String,
    pub last_login_at: Option<String>,
}

/// SQLite enrollment storage, one row per user.
///
/// Descriptors are sealed with AES-256-GCM before they reach SQLite. The key
/// lives next to the database in `.key` (mode 0600) and is created on first
/// open; `:memory:` databases use a fixed all-zero key.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
    cipher: DescriptorCipher,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let in_memory = db_path == Path::new(":memory:");
        let key = if in_memory {
            [0u8; KEY_LEN]
        } else {
            let dir = db_path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir).map_err(|source| StoreError::KeyIo {
                path: dir.display().to_string(),
                source,
            })?;
            load_or_generate_key(&dir.join(".key"))?
        };

        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS enrollments (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL UNIQUE,
                     descriptor BLOB NOT NULL,
                     model_version TEXT,
                     active INTEGER NOT NULL DEFAULT 1,
                     enrolled_at TEXT NOT NULL,
                     last_login_at TEXT
                 );",
            )?;
            Ok(())
        })
        .await?;

        tracing::info!(path = %db_path.display(), "enrollment store opened");
        Ok(Self {
            conn,
            cipher: DescriptorCipher::new(key),
        })
    }

    /// Register or re-register `user`. Re-registration replaces the
    /// descriptor, refreshes `enrolled_at`, reactivates the record, and keeps
    /// the enrollment id. Returns the id.
    pub async fn upsert(&self, user: &str, descriptor: &Descriptor) -> Result<String, StoreError> {
        if descriptor.is_empty() || !descriptor.is_finite() {
            return Err(StoreError::InvalidDescriptor);
        }
        let blob = self.cipher.seal(&descriptor.values)?;
        let fresh_id = uuid::Uuid::new_v4().to_string();
        let enrolled_at = chrono::Utc::now().to_rfc3339();
        let model_version = descriptor.model_version.clone();
        let user = user.to_string();

        let id = self
            .conn
            .call(move |conn| {
                let id: String = conn.query_row(
                    "INSERT INTO enrollments (id, user, descriptor, model_version, active, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)
                     ON CONFLICT(user) DO UPDATE SET
                         descriptor = excluded.descriptor,
                         model_version = excluded.model_version,
                         active = 1,
                         enrolled_at = excluded.enrolled_at
                     RETURNING id",
                    rusqlite::params![fresh_id, user, blob, model_version, enrolled_at],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    /// Active enrollments whose descriptor decrypts. Rows that fail to
    /// decrypt are skipped.
    pub async fn usable_gallery(&self) -> Result<Vec<Enrollment>, StoreError> {
        let rows: Vec<(EnrollmentInfo, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user, model_version, active, enrolled_at, last_login_at, descriptor
                     FROM enrollments WHERE active = 1 ORDER BY enrolled_at",
                )?;
                let rows = stmt.query_map([], |row| Ok((info_from_row(row)?, row.get::<_, Vec<u8>>(6)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut gallery = Vec::with_capacity(rows.len());
        for (info, blob) in rows {
            let values = match self.cipher.open(&blob) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(user = %info.user, id = %info.id, error = %e, "skipping unreadable enrollment");
                    continue;
                }
            };
            let enrollment = Enrollment {
                id: info.id,
                user: info.user,
                descriptor: Descriptor {
                    values,
                    model_version: info.model_version,
                },
                active: info.active,
                enrolled_at: info.enrolled_at,
                last_login_at: info.last_login_at,
            };
            if enrollment.is_usable() {
                gallery.push(enrollment);
            }
        }
        Ok(gallery)
    }

    /// Record a successful login. Touches nothing else.
    pub async fn touch_last_login(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let affected = self
            .conn
            .call(move |conn| Ok(conn.execute("UPDATE enrollments SET last_login_at = ?1 WHERE id = ?2", [&now, &id])?))
            .await?;
        Ok(affected > 0)
    }

    pub async fn set_active(&self, user: &str, active: bool) -> Result<bool, StoreError> {
        let user = user.to_string();
        let affected = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE enrollments SET active = ?1 WHERE user = ?2",
                    rusqlite::params![active, user],
                )?)
            })
            .await?;
        Ok(affected > 0)
    }

    pub async fn get(&self, user: &str) -> Result<Option<EnrollmentInfo>, StoreError> {
        let user = user.to_string();
        let info = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user, model_version, active, enrolled_at, last_login_at
                     FROM enrollments WHERE user = ?1",
                )?;
                let mut rows = stmt.query_map([&user], info_from_row)?;
                Ok(rows.next().transpose()?)
            })
            .await?;
        Ok(info)
    }

    pub async fn list(&self) -> Result<Vec<EnrollmentInfo>, StoreError> {
        let infos = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user, model_version, active, enrolled_at, last_login_at
                     FROM enrollments ORDER BY user",
                )?;
                let rows = stmt.query_map([], info_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(infos)
    }

    pub async fn remove(&self, user: &str) -> Result<bool, StoreError> {
        let user = user.to_string();
        let affected = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM enrollments WHERE user = ?1", [&user])?))
            .await?;
        Ok(affected > 0)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let count = self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM enrollments", [], |row| row.get(0))?))
            .await?;
        Ok(count)
    }
}

fn info_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnrollmentInfo> {
    Ok(EnrollmentInfo {
        id: row.get(0)?,
        user: row.get(1)?,
        model_version: row.get(2)?,
        active: row.get(3)?,
        enrolled_at: row.get(4)?,
        last_login_at: row.get(5)?,
    })
}

/// AES-256-GCM sealing of descriptor values.
///
/// Blob layout: 12-byte random nonce, then ciphertext with the 16-byte tag.
#[derive(Clone)]
struct DescriptorCipher {
    key: [u8; KEY_LEN],
}

impl DescriptorCipher {
    fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    fn seal(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        let plaintext: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        if plaintext.is_empty() || plaintext.len() % 4 != 0 {
            return Err(StoreError::InvalidBlob(plaintext.len()));
        }
        Ok(plaintext
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

fn load_or_generate_key(path: &Path) -> Result<[u8; KEY_LEN], StoreError> {
    let key_io = |source| StoreError::KeyIo {
        path: path.display().to_string(),
        source,
    };

    if path.exists() {
        let bytes = std::fs::read(path).map_err(key_io)?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            key_io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected {KEY_LEN} bytes, found {}", bytes.len()),
            ))
        })?;
        tracing::debug!(path = %path.display(), "loaded descriptor key");
        return Ok(key);
    }

    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);

    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(key_io)?;
    file.write_all(&key).map_err(key_io)?;

    tracing::info!(path = %path.display(), "generated descriptor key");
    Ok(key)
}
