//! Fingerprint sidecar store.
//!
//! Every source document gets a `<file name>.metadata.json` sidecar holding
//! its content hash and which pipeline stages have completed for that exact
//! content. The [`FingerprintStore`] reads, hashes, and atomically rewrites
//! those sidecars.
//!
//! **Access rules:**
//! - A sidecar is written only by the scheduler lane that currently owns its
//!   document; lanes for different documents never touch the same file, so
//!   no locking is involved.
//! - A sidecar that cannot be parsed is logged, moved aside to
//!   `<sidecar>.corrupt`, and treated as "nothing done".

mod record;

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use docpipe_shared::{DocPipeError, Document, Result, SIDECAR_SUFFIX};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

pub use record::FingerprintRecord;

/// Suffix given to an unparsable sidecar when it is moved aside.
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Read buffer size for streaming hashes.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Reads and writes fingerprint sidecars next to source documents.
#[derive(Debug, Clone, Default)]
pub struct FingerprintStore;

impl FingerprintStore {
    pub fn new() -> Self {
        Self
    }

    /// Location of the sidecar for `doc`.
    pub fn sidecar_path(&self, doc: &Document) -> PathBuf {
        doc.sibling(SIDECAR_SUFFIX)
    }

    /// Whether `path` is a fingerprint sidecar.
    pub fn is_sidecar(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX))
    }

    /// SHA-256 over the full contents of `doc`, as lowercase hex.
    pub fn compute_hash(&self, doc: &Document) -> Result<String> {
        hash_file(&doc.path)
    }

    /// Load the record for `doc`, surfacing corruption as an error.
    ///
    /// Returns `Ok(None)` when no sidecar exists.
    pub fn try_load(&self, doc: &Document) -> Result<Option<FingerprintRecord>> {
        let path = self.sidecar_path(doc);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DocPipeError::io(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| DocPipeError::corrupt(&path, e.to_string()))
    }

    /// Load the record for `doc`, falling back to an empty record.
    ///
    /// A missing sidecar yields the default record. An unreadable or
    /// unparsable one is logged and also yields the default record; the
    /// unparsable file is renamed to `<sidecar>.corrupt` first.
    pub fn load(&self, doc: &Document) -> FingerprintRecord {
        match self.try_load(doc) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(doc = %doc, "no sidecar yet");
                FingerprintRecord::default()
            }
            Err(DocPipeError::CorruptMetadata { path, message }) => {
                let backup = corrupt_backup_path(&path);
                warn!(
                    doc = %doc,
                    sidecar = %path.display(),
                    backup = %backup.display(),
                    error = %message,
                    "corrupt sidecar, treating document as unprocessed"
                );
                if let Err(e) = fs::rename(&path, &backup) {
                    warn!(sidecar = %path.display(), error = %e, "could not move corrupt sidecar aside");
                }
                FingerprintRecord::default()
            }
            Err(e) => {
                warn!(doc = %doc, error = %e, "unreadable sidecar, treating document as unprocessed");
                FingerprintRecord::default()
            }
        }
    }

    /// Atomically replace the sidecar for `doc` with `record`.
    pub fn save(&self, doc: &Document, record: &FingerprintRecord) -> Result<()> {
        let path = self.sidecar_path(doc);
        let mut json = serde_json::to_vec_pretty(record)
            .map_err(|e| DocPipeError::Serialize(e.to_string()))?;
        json.push(b'\n');
        write_atomic(&path, &json)?;
        debug!(doc = %doc, hash = %record.hash, "sidecar saved");
        Ok(())
    }
}

/// Write `bytes` to `path` via a temp file in the same directory and a
/// rename, so readers never observe a partially written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            DocPipeError::io(
                path,
                std::io::Error::new(ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
    let tmp = dir.join(format!("{name}.tmp-{}", Uuid::now_v7().simple()));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(DocPipeError::io(path, e));
    }
    Ok(())
}

/// Stream a file through SHA-256.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| DocPipeError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| DocPipeError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn corrupt_backup_path(sidecar: &Path) -> PathBuf {
    let mut name = sidecar.as_os_str().to_owned();
    name.push(CORRUPT_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_shared::StageName;

    fn scratch_doc(tag: &str, content: &[u8]) -> (PathBuf, Document) {
        let dir = std::env::temp_dir().join(format!("docpipe-fp-{tag}-{}", Uuid::now_v7()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("report.pdf");
        fs::write(&path, content).unwrap();
        let doc = Document::new(&dir, &path);
        (dir, doc)
    }

    #[test]
    fn hash_is_sha256_hex() {
        let (dir, doc) = scratch_doc("hash", b"hello world");
        let store = FingerprintStore::new();
        let hash = store.compute_hash(&doc).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn identical_bytes_identical_digest() {
        let (dir_a, a) = scratch_doc("same-a", b"same bytes");
        let (dir_b, b) = scratch_doc("same-b", b"same bytes");
        let store = FingerprintStore::new();
        assert_eq!(store.compute_hash(&a).unwrap(), store.compute_hash(&b).unwrap());

        fs::write(&b.path, b"same bytes!").unwrap();
        assert_ne!(store.compute_hash(&a).unwrap(), store.compute_hash(&b).unwrap());

        let _ = fs::remove_dir_all(&dir_a);
        let _ = fs::remove_dir_all(&dir_b);
    }

    #[test]
    fn missing_sidecar_loads_default() {
        let (dir, doc) = scratch_doc("missing", b"x");
        let store = FingerprintStore::new();
        assert_eq!(store.try_load(&doc).unwrap(), None);
        assert_eq!(store.load(&doc), FingerprintRecord::default());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let (dir, doc) = scratch_doc("roundtrip", b"x");
        let store = FingerprintStore::new();

        let mut record = FingerprintRecord {
            hash: store.compute_hash(&doc).unwrap(),
            ..Default::default()
        };
        record.mark_step(StageName::Convert, true);
        store.save(&doc, &record).unwrap();

        assert!(store.sidecar_path(&doc).ends_with("report.pdf.metadata.json"));
        assert_eq!(store.load(&doc), record);

        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_sidecar_is_recovered_and_preserved() {
        let (dir, doc) = scratch_doc("corrupt", b"x");
        let store = FingerprintStore::new();
        let sidecar = store.sidecar_path(&doc);
        fs::write(&sidecar, b"{\"hash\": \"abc\", \"steps\": ").unwrap();

        let err = store.try_load(&doc).unwrap_err();
        assert!(matches!(err, DocPipeError::CorruptMetadata { .. }));

        let record = store.load(&doc);
        assert_eq!(record, FingerprintRecord::default());
        assert!(!sidecar.exists());
        assert!(dir.join("report.pdf.metadata.json.corrupt").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_replaces_existing_sidecar() {
        let (dir, doc) = scratch_doc("replace", b"x");
        let store = FingerprintStore::new();

        let mut record = FingerprintRecord {
            hash: "h1".into(),
            ..Default::default()
        };
        store.save(&doc, &record).unwrap();
        record.hash = "h2".into();
        record.mark_step(StageName::Convert, true);
        store.save(&doc, &record).unwrap();

        let loaded = store.load(&doc);
        assert_eq!(loaded.hash, "h2");
        assert!(loaded.is_step_done(StageName::Convert));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sidecar_detection() {
        assert!(FingerprintStore::is_sidecar(Path::new("a/b.pdf.metadata.json")));
        assert!(!FingerprintStore::is_sidecar(Path::new("a/b.pdf")));
    }
}
