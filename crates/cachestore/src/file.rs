//! Directory-backed storage medium
//!
//! Layout: one file per key. The key bytes are lowercase-hex encoded and the
//! hex string is cut into segments of at most [`SEGMENT_LEN`] characters;
//! every segment but the last names a directory (with a `.d` suffix), the
//! last names the file. Any key string thus maps to a path whose components
//! stay well under common file-name limits:
//! ```text
//! <dir>/64666263...     short key
//! <dir>/6466...61.d/7878...     key longer than SEGMENT_LEN / 2 bytes
//! ```
//! Writes go to `<file>.tmp` and are renamed into place, so a reader never
//! observes a half-written value.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::medium::{item_size, StorageMedium, DEFAULT_QUOTA};

const TMP_SUFFIX: &str = ".tmp";
const DIR_SUFFIX: &str = ".d";

/// Hex characters per path component
pub const SEGMENT_LEN: usize = 128;

/// Quota-limited medium persisted as files in a directory
pub struct FileMedium {
    /// Root directory of the key tree
    dir: PathBuf,

    /// Bytes accounted against the quota; its write lock serializes writers
    used: RwLock<u64>,

    /// Aggregate quota in bytes
    quota: u64,
}

/// Result of walking the key tree
#[derive(Default)]
struct Scan {
    items: Vec<(String, PathBuf)>,
    stale: Vec<PathBuf>,
}

impl FileMedium {
    /// Open or create a medium in `dir` with the default quota
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::with_quota(dir, DEFAULT_QUOTA)
    }

    /// Open or create a medium in `dir` with the given quota in bytes
    ///
    /// Leftover temporary files from an interrupted write are removed, and
    /// the used size is recomputed from the files on disk.
    pub fn with_quota<P: AsRef<Path>>(dir: P, quota: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let scan = scan(&dir)?;
        for path in &scan.stale {
            debug!(file = %path.display(), "removing stale temporary file");
            fs::remove_file(path)?;
        }

        let mut used = 0u64;
        for (key, path) in &scan.items {
            used += item_size(key, fs::metadata(path)?.len() as usize);
        }

        Ok(Self {
            dir,
            used: RwLock::new(used),
            quota,
        })
    }

    /// Directory backing this medium
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Quota in bytes
    pub fn quota(&self) -> u64 {
        self.quota
    }

    fn item_path(&self, key: &str) -> PathBuf {
        let hex = encode_name(key);
        let mut path = self.dir.clone();
        let mut segments = hex.as_bytes().chunks(SEGMENT_LEN).peekable();

        while let Some(segment) = segments.next() {
            // Chunks of an ASCII hex string are valid UTF-8
            let segment = String::from_utf8_lossy(segment);
            if segments.peek().is_some() {
                path.push(format!("{}{}", segment, DIR_SUFFIX));
            } else {
                path.push(segment.as_ref());
            }
        }
        path
    }

    fn stored_len(path: &Path) -> Result<Option<usize>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len() as usize)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove now-empty segment directories between `path` and the root
    fn prune(&self, path: &Path) {
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == self.dir.as_path() || fs::remove_dir(dir).is_err() {
                break;
            }
            parent = dir.parent();
        }
    }
}

impl StorageMedium for FileMedium {
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.item_path(key);
        if Self::stored_len(&path)?.is_none() {
            return Ok(None);
        }
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut used = self.used.write();
        let path = self.item_path(key);

        let previous = Self::stored_len(&path)?
            .map(|len| item_size(key, len))
            .unwrap_or(0);
        let needed = used.saturating_sub(previous) + item_size(key, value.len());
        if needed > self.quota {
            return Err(Error::QuotaExceeded {
                needed,
                quota: self.quota,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_name = path.clone().into_os_string();
        tmp_name.push(TMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp_name);

        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(value)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, &path)) {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(file = %tmp_path.display(), "failed to remove temporary file: {}", cleanup);
                }
            }
            return Err(e.into());
        }

        *used = needed;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut used = self.used.write();
        let path = self.item_path(key);

        if let Some(len) = Self::stored_len(&path)? {
            fs::remove_file(&path)?;
            *used = used.saturating_sub(item_size(key, len));
            self.prune(&path);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = scan(&self.dir)?.items.into_iter().map(|(key, _)| key).collect();
        keys.sort();
        Ok(keys)
    }

    fn used_bytes(&self) -> u64 {
        *self.used.read()
    }
}

/// Walk the key tree under `root`
fn scan(root: &Path) -> Result<Scan> {
    let mut out = Scan::default();
    scan_dir(root, &mut String::new(), &mut out)?;
    Ok(out)
}

fn scan_dir(dir: &Path, prefix: &mut String, out: &mut Scan) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let Some(segment) = name.strip_suffix(DIR_SUFFIX) else { continue };
            if segment.len() != SEGMENT_LEN || !is_hex(segment) {
                continue;
            }
            let mark = prefix.len();
            prefix.push_str(segment);
            scan_dir(&entry.path(), prefix, out)?;
            prefix.truncate(mark);
        } else if name.ends_with(TMP_SUFFIX) {
            out.stale.push(entry.path());
        } else if name.len() <= SEGMENT_LEN {
            let hex = format!("{}{}", prefix, name);
            if let Some(key) = decode_name(&hex) {
                out.items.push((key, entry.path()));
            }
        }
    }
    Ok(())
}

fn is_hex(name: &str) -> bool {
    name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn encode_name(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_name(name: &str) -> Option<String> {
    if name.is_empty() || name.len() % 2 != 0 || !is_hex(name) {
        return None;
    }

    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&name[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_name_encoding() {
        let name = encode_name("dfb_cache_user:42");
        assert!(name.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(decode_name(&name).as_deref(), Some("dfb_cache_user:42"));
        assert_eq!(decode_name("xyz"), None);
        assert_eq!(decode_name("zz"), None);
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let medium = FileMedium::open(dir.path()).unwrap();

        medium.set_item("contracts", b"[1,2,3]").unwrap();

        assert_eq!(medium.get_item("contracts").unwrap(), Some(b"[1,2,3]".to_vec()));
        assert_eq!(medium.get_item("missing").unwrap(), None);
        assert_eq!(medium.keys().unwrap(), vec!["contracts".to_string()]);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let medium = FileMedium::open(dir.path()).unwrap();
            medium.set_item("a", b"line 1").unwrap();
            medium.set_item("b", b"line 2").unwrap();
        }

        {
            let medium = FileMedium::open(dir.path()).unwrap();
            assert_eq!(medium.get_item("a").unwrap(), Some(b"line 1".to_vec()));
            assert_eq!(medium.get_item("b").unwrap(), Some(b"line 2".to_vec()));
            assert_eq!(medium.used_bytes(), 14);
        }
    }

    #[test]
    fn test_quota_exceeded() {
        let dir = TempDir::new().unwrap();
        let medium = FileMedium::with_quota(dir.path(), 16).unwrap();

        medium.set_item("a", &[b'x'; 10]).unwrap();
        let result = medium.set_item("b", &[b'y'; 10]);

        assert!(matches!(result, Err(Error::QuotaExceeded { needed: 22, quota: 16 })));
        assert_eq!(medium.get_item("b").unwrap(), None);
    }

    #[test]
    fn test_remove_frees_quota() {
        let dir = TempDir::new().unwrap();
        let medium = FileMedium::with_quota(dir.path(), 16).unwrap();

        medium.set_item("a", &[b'x'; 10]).unwrap();
        medium.remove_item("a").unwrap();
        medium.remove_item("a").unwrap();
        medium.set_item("b", &[b'y'; 10]).unwrap();

        assert_eq!(medium.used_bytes(), 11);
    }

    #[test]
    fn test_long_key_round_trip() {
        let dir = TempDir::new().unwrap();
        let key = format!("dfb_cache_contracts:{}", "x".repeat(300));

        {
            let medium = FileMedium::open(dir.path()).unwrap();
            medium.set_item(&key, b"7").unwrap();
            medium.set_item("short", b"1").unwrap();
        }

        let medium = FileMedium::open(dir.path()).unwrap();
        assert_eq!(medium.get_item(&key).unwrap(), Some(b"7".to_vec()));
        assert_eq!(medium.keys().unwrap(), vec![key.clone(), "short".to_string()]);
        assert_eq!(medium.used_bytes(), item_size(&key, 1) + item_size("short", 1));

        for component in medium.item_path(&key).strip_prefix(dir.path()).unwrap() {
            assert!(component.len() <= SEGMENT_LEN + DIR_SUFFIX.len());
        }
    }

    #[test]
    fn test_remove_long_key_prunes_segment_dirs() {
        let dir = TempDir::new().unwrap();
        let medium = FileMedium::open(dir.path()).unwrap();
        let key = "y".repeat(200);

        medium.set_item(&key, b"v").unwrap();
        medium.remove_item(&key).unwrap();

        assert_eq!(medium.get_item(&key).unwrap(), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(medium.used_bytes(), 0);
    }

    #[test]
    fn test_key_that_is_a_prefix_of_a_long_key() {
        let dir = TempDir::new().unwrap();
        let medium = FileMedium::open(dir.path()).unwrap();
        let short = "z".repeat(SEGMENT_LEN / 2);
        let long = "z".repeat(SEGMENT_LEN);

        medium.set_item(&short, b"short").unwrap();
        medium.set_item(&long, b"long").unwrap();

        assert_eq!(medium.get_item(&short).unwrap(), Some(b"short".to_vec()));
        assert_eq!(medium.get_item(&long).unwrap(), Some(b"long".to_vec()));
        assert_eq!(medium.keys().unwrap().len(), 2);
    }

    #[test]
    fn test_externally_resized_file_does_not_underflow() {
        let dir = TempDir::new().unwrap();
        let medium = FileMedium::open(dir.path()).unwrap();
        medium.set_item("a", &[b'x'; 10]).unwrap();

        // Grown behind the medium's back, then removed through it
        fs::write(medium.item_path("a"), [b'x'; 100]).unwrap();
        medium.remove_item("a").unwrap();
        assert_eq!(medium.used_bytes(), 0);

        medium.set_item("b", &[b'y'; 4]).unwrap();
        fs::write(medium.item_path("b"), [b'y'; 100]).unwrap();
        medium.set_item("b", &[b'y'; 4]).unwrap();
        assert_eq!(medium.used_bytes(), 5);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_write_leaves_no_tmp_file() {
        let dir = TempDir::new().unwrap();
        let medium = FileMedium::open(dir.path()).unwrap();

        // A directory where the item file should go makes the rename fail
        fs::create_dir(medium.item_path("a")).unwrap();
        fs::write(medium.item_path("a").join("blocker"), b"").unwrap();

        assert!(matches!(medium.set_item("a", b"value"), Err(Error::Io(_))));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_stale_tmp_files_are_cleaned() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(format!("{}{}", encode_name("a"), TMP_SUFFIX)), b"partial").unwrap();

        let medium = FileMedium::open(dir.path()).unwrap();

        assert!(medium.keys().unwrap().is_empty());
        assert_eq!(medium.used_bytes(), 0);
    }
}
