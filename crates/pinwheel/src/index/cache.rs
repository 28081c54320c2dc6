//! The on-disk cache behind the index: one store holds HTTP responses, another holds metadata
//! records. The store only deals in locked, atomically replaced byte entries; what a key *means*
//! is decided by the [`CacheKey`] constructors, which encode how pinwheel identifies the things
//! it caches.

use crate::types::{ArtifactHashes, ArtifactInfo, ArtifactName, NormalizedPackageName, Version};
use crate::utils::retry_interrupted;
use data_encoding::HEXLOWER;
use fs4::FileExt;
use http::header::{ACCEPT, CACHE_CONTROL};
use http::{HeaderMap, Method};
use rattler_digest::{compute_bytes_digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use url::Url;

/// Identifies one cache entry. Keys carry a kind prefix so the different families of entries
/// never collide, and a hex digest that doubles as a filesystem-safe path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    kind: &'static str,
    digest: String,
}

impl CacheKey {
    /// The metadata entry of a release file.
    ///
    /// Wheels are keyed by their content hash when the index provides one, so the same wheel
    /// reached through different URLs or mirrors shares a single entry. Everything else, sdists
    /// in particular, is keyed by filename.
    pub fn for_artifact(artifact: &ArtifactInfo) -> CacheKey {
        match (&artifact.filename, &artifact.hashes) {
            (ArtifactName::Wheel(_), Some(ArtifactHashes { sha256: Some(hash) })) => CacheKey {
                kind: "sha256",
                digest: HEXLOWER.encode(hash.as_slice()),
            },
            _ => CacheKey::digested("artifact", artifact.filename.to_string().as_bytes()),
        }
    }

    /// The per-release JSON document of a `(name, version)` pair.
    pub fn for_release(name: &NormalizedPackageName, version: &Version) -> CacheKey {
        CacheKey::digested(
            "release",
            format!("{}-{}", name.as_str(), version).as_bytes(),
        )
    }

    /// An HTTP response, keyed by method, url (without its fragment) and the headers that select
    /// a representation.
    pub fn for_request(method: &Method, url: &Url, headers: &HeaderMap) -> CacheKey {
        let mut material = Vec::new();
        push_field(&mut material, method.as_str().as_bytes());

        let mut url = url.clone();
        url.set_fragment(None);
        push_field(&mut material, url.as_str().as_bytes());

        for name in [ACCEPT, CACHE_CONTROL] {
            if let Some(value) = headers.get(&name) {
                push_field(&mut material, name.as_str().as_bytes());
                push_field(&mut material, value.as_bytes());
            }
        }

        CacheKey::digested("request", &material)
    }

    fn digested(kind: &'static str, material: &[u8]) -> CacheKey {
        let hash = compute_bytes_digest::<Sha256>(material);
        CacheKey {
            kind,
            digest: HEXLOWER.encode(hash.as_slice()),
        }
    }

    /// `<kind>/<two hex chars>/<rest>`; the fanout keeps single directories from growing huge.
    fn relative_path(&self) -> PathBuf {
        let (fanout, rest) = self.digest.split_at(2);
        [self.kind, fanout, rest].iter().collect()
    }
}

/// Length-prefix every field so distinct tuples can never produce the same material.
fn push_field(material: &mut Vec<u8>, bytes: &[u8]) {
    material.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    material.extend_from_slice(bytes);
}

/// A directory of cache entries with per-entry lock files.
///
/// Writes go to a scratch file first and are published with a rename, so readers never observe a
/// partial entry, whether they are other tasks in this process or a second process sharing the
/// cache directory.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    scratch: PathBuf,
}

impl CacheStore {
    /// Opens (creating if necessary) the store rooted at `root`.
    pub fn at(root: &Path) -> io::Result<CacheStore> {
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;

        // Scratch files live under the same root so publishing never crosses a filesystem.
        let scratch = root.join(".scratch");
        fs::create_dir_all(&scratch)?;

        Ok(CacheStore { root, scratch })
    }

    /// Locks the entry for `key`, creating its parent directories as needed.
    pub fn entry(&self, key: &CacheKey) -> io::Result<Entry<'_>> {
        let path = self.root.join(key.relative_path());
        let lock = lock_entry(&path, LockMode::Create)?.expect("Create mode always yields a lock");
        Ok(Entry {
            scratch: &self.scratch,
            path,
            _lock: lock,
        })
    }

    /// Locks the entry for `key` only if it was ever written; a miss creates no directories.
    pub fn existing_entry(&self, key: &CacheKey) -> Option<Entry<'_>> {
        let path = self.root.join(key.relative_path());
        let lock = lock_entry(&path, LockMode::IfPresent).ok()??;
        Some(Entry {
            scratch: &self.scratch,
            path,
            _lock: lock,
        })
    }

    /// Reads the full content stored under `key`, or `None` on a miss.
    pub fn read(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let entry = self.existing_entry(key)?;
        let mut bytes = Vec::new();
        entry.open()?.read_to_end(&mut bytes).ok()?;
        Some(bytes)
    }

    /// Stores `bytes` under `key` unless the entry already has content. Entries are immutable
    /// once written this way, which is what makes handing out read handles after unlock safe.
    pub fn write_once(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        let entry = self.entry(key)?;
        if entry.open().is_none() {
            let mut writer = entry.writer()?;
            writer.write_all(bytes)?;
            writer.finish()?;
        }
        Ok(())
    }
}

/// An exclusively locked cache entry. The lock is a sibling `.lock` file held for the lifetime
/// of this value; dropping the entry lets the next waiter in.
pub struct Entry<'s> {
    scratch: &'s Path,
    path: PathBuf,
    _lock: File,
}

impl<'s> Entry<'s> {
    /// Opens the current content of the entry. `None` if nothing was ever written. The returned
    /// handle stays valid after the entry unlocks: replacement happens by rename, which leaves
    /// already opened files untouched.
    pub fn open(&self) -> Option<File> {
        File::open(&self.path).ok()
    }

    /// Starts replacing the content of the entry. Nothing becomes visible until
    /// [`EntryWriter::finish`] runs.
    pub fn writer(&self) -> io::Result<EntryWriter<'_>> {
        Ok(EntryWriter {
            target: &self.path,
            file: tempfile::NamedTempFile::new_in(self.scratch)?,
        })
    }

    /// Removes the content of the entry, for responses that turn out to be uncacheable.
    pub fn discard(self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// An in-progress entry replacement backed by a scratch file.
pub struct EntryWriter<'e> {
    target: &'e Path,
    file: tempfile::NamedTempFile,
}

impl<'e> Write for EntryWriter<'e> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl<'e> Seek for EntryWriter<'e> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl<'e> EntryWriter<'e> {
    /// Atomically publishes the written content and reopens it for reading.
    pub fn finish(self) -> io::Result<File> {
        self.file.as_file().sync_data()?;
        let mut file = self.file.persist(self.target)?;
        file.rewind()?;
        Ok(file)
    }
}

enum LockMode {
    Create,
    IfPresent,
}

/// Opens and flocks the `.lock` sibling of an entry path. With [`LockMode::IfPresent`] a missing
/// lock file means the entry was never written and `Ok(None)` is returned.
fn lock_entry(path: &Path, mode: LockMode) -> io::Result<Option<File>> {
    // Key digests contain no dots, so this appends rather than replacing anything.
    let lock_path = path.with_extension("lock");

    let mut options = fs::OpenOptions::new();
    // Windows requires write access for the file to be exclusively lockable.
    options.write(true);

    if matches!(mode, LockMode::Create) {
        let dir = path.parent().expect("cache entries always have a parent");
        fs::create_dir_all(dir)?;
        options.create(true);
    }

    let lock = match options.open(&lock_path) {
        Ok(file) => file,
        Err(err) if matches!(mode, LockMode::IfPresent) && err.kind() == io::ErrorKind::NotFound => {
            return Ok(None)
        }
        Err(err) => return Err(err),
    };

    // flock(2) does not retry on EINTR for us.
    retry_interrupted(|| lock.lock_exclusive())?;

    Ok(Some(lock))
}
