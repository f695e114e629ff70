//! Streaming BLAKE3 file digests with bounded retry.
//!
//! Files are read in fixed-size chunks so memory stays bounded regardless of
//! file size. Batches are hashed in parallel; results come back path-sorted so
//! callers see the same order for the same input.

use crate::error::{GuardError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default buffer size for streaming reads (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    /// BLAKE3 hex
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Hasher {
    chunk_size: usize,
    retries: u32,
    retry_delay: Duration,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY)
    }
}

impl Hasher {
    pub fn new(chunk_size: usize, retries: u32, retry_delay: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            retries: retries.max(1),
            retry_delay,
        }
    }

    /// Digest one file. Transient failures are retried with linear backoff;
    /// missing files fail immediately with `Access`.
    pub fn digest(&self, path: &Path) -> Result<FileDigest> {
        let mut last_err: Option<std::io::Error> = None;
        let mut denied_every_time = true;

        for attempt in 1..=self.retries {
            match self.digest_once(path) {
                Ok(d) => return Ok(d),
                Err(e) => match classify_io(&e) {
                    IoClass::Fatal => {
                        return Err(GuardError::Access {
                            path: path.to_path_buf(),
                            source: e,
                        })
                    }
                    class => {
                        if class != IoClass::Denied {
                            denied_every_time = false;
                        }
                        debug!(
                            path = %path.display(),
                            attempt,
                            error = %e,
                            "transient read failure while hashing"
                        );
                        last_err = Some(e);
                        if attempt < self.retries {
                            std::thread::sleep(self.retry_delay * attempt);
                        }
                    }
                },
            }
        }

        let source = last_err.unwrap_or_else(|| std::io::Error::from(ErrorKind::Other));
        if denied_every_time {
            warn!(path = %path.display(), "permission denied on every attempt");
            Err(GuardError::Access {
                path: path.to_path_buf(),
                source,
            })
        } else {
            Err(GuardError::TransientIo {
                path: path.to_path_buf(),
                attempts: self.retries,
                source,
            })
        }
    }

    fn digest_once(&self, path: &Path) -> std::io::Result<FileDigest> {
        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as u64;
        }
        Ok(FileDigest {
            digest: hasher.finalize().to_hex().to_string(),
            size,
        })
    }

    /// Hash a batch in parallel. Order of hashing is irrelevant; the returned
    /// vector is sorted by path.
    pub fn digest_all(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Result<FileDigest>)> {
        let mut results: Vec<(PathBuf, Result<FileDigest>)> = paths
            .par_iter()
            .map(|p| (p.clone(), self.digest(p)))
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoClass {
    /// Worth retrying: interrupted or contended reads.
    Transient,
    /// Permission failure; may be a race with a writer holding the file.
    Denied,
    /// Not going to change by retrying.
    Fatal,
}

fn classify_io(e: &std::io::Error) -> IoClass {
    match e.kind() {
        ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut
        | ErrorKind::UnexpectedEof => IoClass::Transient,
        ErrorKind::PermissionDenied => IoClass::Denied,
        ErrorKind::NotFound | ErrorKind::InvalidInput | ErrorKind::Unsupported => IoClass::Fatal,
        // Sharing violations on Windows and EBUSY-like conditions surface as
        // uncategorized errors.
        _ => IoClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn quick() -> Hasher {
        Hasher::new(4, 2, Duration::from_millis(1))
    }

    #[test]
    fn digest_matches_one_shot_blake3() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("a.txt");
        fs::write(&p, b"hello world, streamed in tiny chunks").unwrap();
        let d = quick().digest(&p).unwrap();
        assert_eq!(d.size, 36);
        assert_eq!(
            d.digest,
            blake3::hash(b"hello world, streamed in tiny chunks")
                .to_hex()
                .to_string()
        );
    }

    #[test]
    fn missing_file_is_access_error() {
        let dir = tempdir().unwrap();
        let err = quick().digest(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, GuardError::Access { .. }));
    }

    #[test]
    fn empty_file_has_stable_digest() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("empty");
        fs::write(&p, b"").unwrap();
        let d = quick().digest(&p).unwrap();
        assert_eq!(d.size, 0);
        assert_eq!(d.digest, blake3::hash(b"").to_hex().to_string());
    }

    #[test]
    fn batch_results_are_path_sorted() {
        let dir = tempdir().unwrap();
        let mut paths = Vec::new();
        for name in ["c.txt", "a.txt", "b.txt"] {
            let p = dir.path().join(name);
            fs::write(&p, name).unwrap();
            paths.push(p);
        }
        paths.push(dir.path().join("gone.txt"));
        let results = quick().digest_all(&paths);
        let names: Vec<_> = results
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt", "gone.txt"]);
        assert!(results[3].1.is_err());
    }

    #[test]
    fn classification_of_io_kinds() {
        use std::io::Error;
        assert_eq!(classify_io(&Error::from(ErrorKind::NotFound)), IoClass::Fatal);
        assert_eq!(
            classify_io(&Error::from(ErrorKind::PermissionDenied)),
            IoClass::Denied
        );
        assert_eq!(
            classify_io(&Error::from(ErrorKind::Interrupted)),
            IoClass::Transient
        );
    }
}
