//! Maildir-format message store.
//!
//! Messages are written to `tmp/` and then renamed into `new/`, so a
//! reader never observes a partial delivery. Filenames follow the
//! maildir convention of time-and-uniqueness components joined with the
//! delivering host name; uniqueness within the process comes from a
//! monotonically increasing counter rather than from re-reading process
//! state at the call site.

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static DELIVERY_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("creating maildir structure under {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing message file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("delivering message to {path}: {source}")]
    Deliver {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid message id {0:?}")]
    InvalidId(String),
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// The envelope-plus-content bundle the store persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
    pub content: String,
}

/// A maildir rooted at `path`, with the conventional `new`, `cur` and
/// `tmp` children.
#[derive(Debug, Clone)]
pub struct Maildir {
    path: PathBuf,
    hostname: String,
}

impl Maildir {
    /// Open (creating if needed) a maildir at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        for sub in ["new", "cur", "tmp"] {
            let dir = path.join(sub);
            fs::create_dir_all(&dir).map_err(|source| StoreError::Create {
                path: dir.clone(),
                source,
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o750));
            }
        }

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        Ok(Self { path, hostname })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deliver an envelope into `new/`, returning the message id (the
    /// file's basename).
    pub fn store_new(&self, envelope: &Envelope) -> Result<String, StoreError> {
        let id = self.next_id();
        let tmp_path = self.path.join("tmp").join(&id);

        let mut file = fs::File::create(&tmp_path).map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        self.write_envelope(&mut file, envelope)
            .and_then(|_| file.sync_all())
            .map_err(|source| {
                let _ = fs::remove_file(&tmp_path);
                StoreError::Write {
                    path: tmp_path.clone(),
                    source,
                }
            })?;
        drop(file);

        let new_path = self.path.join("new").join(&id);
        fs::rename(&tmp_path, &new_path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::Deliver {
                path: new_path.clone(),
                source,
            }
        })?;

        Ok(id)
    }

    fn write_envelope(&self, file: &mut fs::File, envelope: &Envelope) -> std::io::Result<()> {
        write!(file, "From: {}\r\n", envelope.from)?;
        if !envelope.to.is_empty() {
            write!(file, "To: {}\r\n", envelope.to.join(", "))?;
        }
        write!(
            file,
            "Received: by {}; {}\r\n",
            self.hostname,
            Utc::now().to_rfc2822()
        )?;
        write!(file, "\r\n")?;
        file.write_all(envelope.content.as_bytes())
    }

    fn next_id(&self) -> String {
        let now = Utc::now();
        let count = DELIVERY_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}.{}_{}_{}.{}",
            now.timestamp(),
            now.timestamp_subsec_micros(),
            std::process::id(),
            count,
            self.hostname,
        )
    }

    /// Every message file in `new/` and `cur/`, in no particular order.
    pub fn list(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = vec![];
        for sub in ["new", "cur"] {
            let dir = self.path.join(sub);
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    entries.push(entry.path());
                }
            }
        }
        Ok(entries)
    }

    /// Delete a message by id (basename only). Ids containing path
    /// separators are rejected outright.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        for sub in ["new", "cur"] {
            let candidate = self.path.join(sub).join(id);
            match fs::remove_file(&candidate) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::NotFound(id.to_string()))
    }

    /// Remove every stored message, returning how many were deleted.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for path in self.list()? {
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            from: "sender@example.com".to_string(),
            to: vec!["one@example.net".to_string(), "two@example.net".to_string()],
            content: "Subject: hi\r\n\r\nbody\r\n".to_string(),
        }
    }

    #[test]
    fn store_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Maildir::create(dir.path().join("mbox")).unwrap();

        let id = maildir.store_new(&sample()).unwrap();
        let stored = dir.path().join("mbox").join("new").join(&id);
        let text = fs::read_to_string(&stored).unwrap();

        assert!(text.starts_with("From: sender@example.com\r\n"));
        assert!(text.contains("To: one@example.net, two@example.net\r\n"));
        assert!(text.contains("Received: by "));
        assert!(text.ends_with("Subject: hi\r\n\r\nbody\r\n"));

        // tmp/ holds nothing after a successful delivery.
        let tmp_entries: Vec<_> = fs::read_dir(dir.path().join("mbox/tmp"))
            .unwrap()
            .collect();
        assert!(tmp_entries.is_empty());
    }

    #[test]
    fn ids_are_unique_across_rapid_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Maildir::create(dir.path()).unwrap();

        let mut ids = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(ids.insert(maildir.store_new(&sample()).unwrap()));
        }
        assert_eq!(maildir.list().unwrap().len(), 100);
    }

    #[test]
    fn delete_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Maildir::create(dir.path()).unwrap();

        let id = maildir.store_new(&sample()).unwrap();
        maildir.delete(&id).unwrap();
        assert!(maildir.list().unwrap().is_empty());
        assert!(matches!(
            maildir.delete(&id),
            Err(StoreError::NotFound(_))
        ));

        for _ in 0..3 {
            maildir.store_new(&sample()).unwrap();
        }
        assert_eq!(maildir.clear().unwrap(), 3);
        assert!(maildir.list().unwrap().is_empty());
    }

    #[test]
    fn traversal_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Maildir::create(dir.path()).unwrap();

        for bad in ["../../etc/passwd", "a/b", "..", ""] {
            assert!(matches!(
                maildir.delete(bad),
                Err(StoreError::InvalidId(_))
            ));
        }
    }

    #[test]
    fn null_sender_still_writes_headers() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Maildir::create(dir.path()).unwrap();

        let id = maildir
            .store_new(&Envelope {
                from: String::new(),
                to: vec![],
                content: "x".to_string(),
            })
            .unwrap();
        let text = fs::read_to_string(dir.path().join("new").join(id)).unwrap();
        assert!(text.starts_with("From: \r\n"));
        assert!(!text.contains("To: "));
    }
}
