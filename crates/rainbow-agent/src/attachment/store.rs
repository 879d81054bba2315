use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use ignore::WalkBuilder;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{AttachmentError, AttachmentKind};

/// Maximum directory depth searched when probing fails.
const MAX_WALK_DEPTH: usize = 6;

/// Public prefix of references handed out by [`DirectoryStore::put`].
const UPLOADS_PREFIX: &str = "uploads/";

/// Persistence and lookup for uploaded attachment bytes.
pub trait AttachmentStore: Send + Sync {
    /// Store `bytes` and return a stable reference to them.
    fn put(&self, kind: AttachmentKind, filename: &str, bytes: &[u8])
        -> Result<String, AttachmentError>;

    /// Load the bytes behind `reference`, or `NotFound`.
    fn resolve(&self, reference: &str) -> Result<Vec<u8>, AttachmentError>;

    /// Reference of the most recently stored attachment of `kind`.
    fn latest(&self, kind: AttachmentKind) -> Result<Option<String>, AttachmentError>;
}

/// Stores uploads under `{root}/{kind}/{uuid}_{filename}` and hands out
/// `/uploads/{kind}/{uuid}_{filename}` references.
///
/// Resolution tries a fixed list of candidate paths first, then walks the
/// root and probe roots once looking for the file name. Only files whose
/// canonical path lies under the root or a probe root are ever read.
pub struct DirectoryStore {
    root: PathBuf,
    probe_roots: Vec<PathBuf>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            probe_roots: Vec::new(),
        }
    }

    /// Additional base directories that relative references may live under.
    pub fn with_probe_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.probe_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Ordered, de-duplicated paths checked before falling back to a walk.
    fn candidates(&self, reference: &str) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        let mut push = |p: PathBuf| {
            if !out.contains(&p) {
                out.push(p);
            }
        };

        let as_path = Path::new(reference);
        if as_path.is_absolute() && self.bases().any(|base| as_path.starts_with(base)) {
            push(as_path.to_path_buf());
        }

        let relative = reference.trim_start_matches('/');
        let without_prefix = relative.strip_prefix(UPLOADS_PREFIX).unwrap_or(relative);
        if !without_prefix.is_empty() {
            push(self.root.join(without_prefix));
        }
        for base in &self.probe_roots {
            if !relative.is_empty() {
                push(base.join(relative));
            }
            if !without_prefix.is_empty() {
                push(base.join(without_prefix));
            }
        }

        if let Some(name) = basename(reference) {
            for kind in AttachmentKind::ALL {
                push(self.root.join(kind.as_str()).join(name));
            }
        }
        out
    }

    fn bases(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.root).chain(self.probe_roots.iter())
    }

    /// Canonical form of `path` if it is a file under one of the bases.
    fn confined(&self, path: &Path) -> Option<PathBuf> {
        let real = fs::canonicalize(path).ok()?;
        if !real.is_file() {
            return None;
        }
        let inside = self
            .bases()
            .filter_map(|base| fs::canonicalize(base).ok())
            .any(|base| real.starts_with(base));
        if !inside {
            warn!(path = %path.display(), "refusing attachment path outside upload directories");
            return None;
        }
        Some(real)
    }

    /// One bounded pass over the root and probe roots.
    fn walk_for(&self, name: &str) -> Option<PathBuf> {
        let mut roots = self.bases();
        let first = roots.next()?;
        let mut builder = WalkBuilder::new(first);
        for extra in roots {
            builder.add(extra);
        }
        builder
            .max_depth(Some(MAX_WALK_DEPTH))
            .hidden(false)
            .git_ignore(false)
            .ignore(false)
            .follow_links(false);

        builder
            .build()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_some_and(|t| t.is_file())
                    && entry.file_name().to_str() == Some(name)
            })
            .find_map(|entry| self.confined(entry.path()))
    }
}

impl AttachmentStore for DirectoryStore {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    fn put(
        &self,
        kind: AttachmentKind,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, AttachmentError> {
        let name = format!(
            "{}_{}",
            Uuid::new_v4(),
            basename(filename).unwrap_or("upload")
        );
        let dir = self.root.join(kind.as_str());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(&name), bytes)?;

        let reference = format!("/{UPLOADS_PREFIX}{}/{}", kind.as_str(), name);
        debug!(%reference, "attachment stored");
        Ok(reference)
    }

    #[instrument(skip(self))]
    fn resolve(&self, reference: &str) -> Result<Vec<u8>, AttachmentError> {
        let not_found = || AttachmentError::NotFound(reference.to_string());
        if reference.trim().is_empty() {
            return Err(not_found());
        }
        if Path::new(reference)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(AttachmentError::OutsideRoot(reference.to_string()));
        }

        if let Some(path) = self
            .candidates(reference)
            .into_iter()
            .find_map(|p| self.confined(&p))
        {
            debug!(path = %path.display(), "reference resolved by probe");
            return Ok(fs::read(path)?);
        }

        let name = basename(reference).ok_or_else(not_found)?;
        match self.walk_for(name) {
            Some(path) => {
                debug!(path = %path.display(), "reference resolved by directory walk");
                Ok(fs::read(path)?)
            }
            None => Err(not_found()),
        }
    }

    fn latest(&self, kind: AttachmentKind) -> Result<Option<String>, AttachmentError> {
        let dir = self.root.join(kind.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<(SystemTime, String)> = None;
        for entry in entries.filter_map(|e| e.ok()) {
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, entry.file_name().to_string_lossy().into_owned()));
            }
        }

        Ok(newest.map(|(_, name)| format!("/{UPLOADS_PREFIX}{}/{}", kind.as_str(), name)))
    }
}

fn basename(reference: &str) -> Option<&str> {
    reference
        .rsplit(['/', '\\'])
        .next()
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_resolve_by_returned_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());

        let reference = store
            .put(AttachmentKind::Document, "notes.txt", "第一行".as_bytes())
            .unwrap();
        assert!(reference.starts_with("/uploads/document/"));
        assert_eq!(store.resolve(&reference).unwrap(), "第一行".as_bytes());
    }

    #[test]
    fn put_strips_directories_from_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let reference = store
            .put(AttachmentKind::Unknown, "../../escape.bin", b"x")
            .unwrap();
        assert!(reference.ends_with("_escape.bin"));
        assert!(!reference.contains(".."));
    }

    #[test]
    fn resolves_absolute_paths_and_probe_roots() {
        let dir = tempfile::tempdir().unwrap();
        let probe = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(probe.path().join("docs")).unwrap();
        std::fs::write(probe.path().join("docs/a.txt"), b"probe").unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let abs = uploads.join("abs.txt");
        std::fs::write(&abs, b"absolute").unwrap();

        let store = DirectoryStore::new(&uploads).with_probe_roots([probe.path()]);
        assert_eq!(store.resolve(abs.to_str().unwrap()).unwrap(), b"absolute");
        assert_eq!(store.resolve("/docs/a.txt").unwrap(), b"probe");
    }

    #[test]
    fn files_outside_the_roots_are_never_read() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let secret = elsewhere.path().join("secret.txt");
        std::fs::write(&secret, b"TOP-SECRET").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ok").unwrap();

        let store = DirectoryStore::new(dir.path().join("uploads"))
            .with_probe_roots([dir.path().join("uploads")]);
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();

        assert!(matches!(
            store.resolve(secret.to_str().unwrap()),
            Err(AttachmentError::NotFound(_))
        ));
        assert!(matches!(
            store.resolve("/etc/hostname"),
            Err(AttachmentError::NotFound(_))
        ));
        assert!(matches!(
            store.resolve("../notes.txt"),
            Err(AttachmentError::OutsideRoot(_))
        ));
        assert!(matches!(
            store.resolve("/uploads/document/../../notes.txt"),
            Err(AttachmentError::OutsideRoot(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_leaving_the_root_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        std::fs::write(elsewhere.path().join("secret.txt"), b"TOP-SECRET").unwrap();
        std::fs::create_dir_all(dir.path().join("document")).unwrap();
        std::os::unix::fs::symlink(
            elsewhere.path().join("secret.txt"),
            dir.path().join("document/link.txt"),
        )
        .unwrap();

        let store = DirectoryStore::new(dir.path());
        assert!(matches!(
            store.resolve("/uploads/document/link.txt"),
            Err(AttachmentError::NotFound(_))
        ));
    }

    #[test]
    fn falls_back_to_walk_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep/er/still");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("hidden.csv"), b"a,b").unwrap();

        let store = DirectoryStore::new(dir.path());
        assert_eq!(store.resolve("/somewhere/else/hidden.csv").unwrap(), b"a,b");
    }

    #[test]
    fn exhausted_search_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let err = store.resolve("/uploads/document/missing.txt").unwrap_err();
        assert!(matches!(err, AttachmentError::NotFound(r) if r == "/uploads/document/missing.txt"));
        assert!(matches!(store.resolve(""), Err(AttachmentError::NotFound(_))));
    }

    #[test]
    fn latest_picks_newest_file_of_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        assert!(store.latest(AttachmentKind::Document).unwrap().is_none());

        let first = store.put(AttachmentKind::Document, "old.txt", b"old").unwrap();
        let first_path = dir.path().join("document").join(basename(&first).unwrap());
        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&first_path)
            .unwrap()
            .set_modified(past)
            .unwrap();
        let second = store.put(AttachmentKind::Document, "new.txt", b"new").unwrap();

        assert_eq!(store.latest(AttachmentKind::Document).unwrap(), Some(second));
        assert!(store.latest(AttachmentKind::Image).unwrap().is_none());
    }
}
