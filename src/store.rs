//! Persistent content store for the bulletin board.
//!
//! Provides an append-only content file per board directory with:
//! - Exclusive `flock` locking around every append
//! - One rendered html entry per accepted post
//! - One-time installation of the main page that includes the content file
//!
//! All operations are blocking; async callers run them on the blocking pool.

use crate::assets::{self, ENTRY_WITHOUT_IMAGE_TEMPLATE, ENTRY_WITH_IMAGE_TEMPLATE};
use crate::protocol::Post;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// File name of the append-only content file.
pub const CONTENT_FILE_NAME: &str = "bulletin_board_content.dat";

/// File name of the main page.
pub const MAIN_PAGE_NAME: &str = "bulletin_board.php";

/// Content store errors. Each variant carries the OS error text.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unable to create main page {}: {source}", path.display())]
    MainPage { path: PathBuf, source: io::Error },

    #[error("unable to open file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("unable to lock file {}: {source}", path.display())]
    Lock { path: PathBuf, source: io::Error },

    #[error("unable to write to file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("unable to close (flush) file {}: {source}", path.display())]
    Close { path: PathBuf, source: io::Error },
}

/// Append-only store rooted at one board directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    /// Create a store for `dir`. Nothing is touched on disk.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        info!(dir = %dir.display(), "Using board directory");
        Self { dir }
    }

    pub fn content_path(&self) -> PathBuf {
        self.dir.join(CONTENT_FILE_NAME)
    }

    pub fn main_page_path(&self) -> PathBuf {
        self.dir.join(MAIN_PAGE_NAME)
    }

    /// Install the main page unless it already exists.
    ///
    /// Returns `true` if the page was created by this call. A failed write
    /// removes the partial file so a later call can try again.
    pub fn prepare_main_page(&self) -> Result<bool, StoreError> {
        let path = self.main_page_path();
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(source) => return Err(StoreError::MainPage { path, source }),
        };

        if let Err(source) = file.write_all(assets::MAIN_PAGE.as_bytes()) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(StoreError::MainPage { path, source });
        }

        info!(path = %path.display(), "Created main page");
        Ok(true)
    }

    /// Append the rendered entry for `post` under an exclusive lock.
    ///
    /// Returns the number of bytes written.
    pub fn append(&self, post: &Post) -> Result<usize, StoreError> {
        let path = self.content_path();
        let entry = render_entry(post);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&path)
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;

        let lock = ExclusiveLock::acquire(&file).map_err(|source| StoreError::Lock {
            path: path.clone(),
            source,
        })?;
        trace!(path = %path.display(), "Acquired content lock");

        let mut writer = &file;
        writer
            .write_all(entry.as_bytes())
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        flush_to_disk(&file, &path)?;

        drop(lock);
        debug!(user = %post.user, bytes = entry.len(), "Appended content entry");
        Ok(entry.len())
    }
}

/// Flush written data to the device before the lock is released.
fn flush_to_disk(file: &File, path: &Path) -> Result<(), StoreError> {
    file.sync_data().map_err(|source| StoreError::Close {
        path: path.to_path_buf(),
        source,
    })
}

/// Render the content entry for a post.
pub fn render_entry(post: &Post) -> String {
    match &post.image {
        Some(image) => assets::fill(
            ENTRY_WITH_IMAGE_TEMPLATE,
            &[
                ("image", image),
                ("user", &post.user),
                ("message", &post.message),
            ],
        ),
        None => assets::fill(
            ENTRY_WITHOUT_IMAGE_TEMPLATE,
            &[("user", &post.user), ("message", &post.message)],
        ),
    }
}

/// Exclusive advisory lock on an open file, released on drop.
struct ExclusiveLock<'a> {
    file: &'a File,
}

impl<'a> ExclusiveLock<'a> {
    fn acquire(file: &'a File) -> io::Result<Self> {
        loop {
            // SAFETY: the descriptor is owned by `file`, which outlives the lock.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        // SAFETY: see `acquire`. Closing the file would release the lock as well.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn post(user: &str, message: &str) -> Post {
        Post::new(user, None, message)
    }

    #[test]
    fn test_render_entry_without_image() {
        let entry = render_entry(&post("alice", "hello <em>all</em>"));
        assert!(entry.contains("alice"));
        assert!(entry.contains("hello <em>all</em>"));
        assert!(!entry.contains("{{"));
    }

    #[test]
    fn test_render_entry_with_image() {
        let entry = render_entry(&Post::new(
            "bob",
            Some("http://example.com/bob.png".to_string()),
            "hi",
        ));
        assert!(entry.contains("src=\"http://example.com/bob.png\""));
        assert_eq!(entry.matches("bob").count(), 3);
    }

    #[test]
    fn test_append_accumulates_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());

        let first = store.append(&post("alice", "one")).unwrap();
        let second = store.append(&post("bob", "two")).unwrap();

        let content = fs::read_to_string(store.content_path()).unwrap();
        assert_eq!(content.len(), first + second);
        assert_eq!(
            content,
            render_entry(&post("alice", "one")) + &render_entry(&post("bob", "two"))
        );
    }

    #[test]
    fn test_append_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("missing"));

        let err = store.append(&post("alice", "one")).unwrap_err();
        assert!(matches!(err, StoreError::Open { .. }));
        assert!(err.to_string().contains("No such file or directory"));
    }

    #[test]
    fn test_flush_failure_is_reported() {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for both pipe ends.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: both descriptors were just created and are owned here.
        let (reader, writer) = unsafe {
            use std::os::unix::io::FromRawFd;
            (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1]))
        };

        let err = flush_to_disk(&writer, Path::new("pipe")).unwrap_err();
        assert!(matches!(err, StoreError::Close { .. }));
        assert!(err.to_string().starts_with("unable to close (flush) file pipe: "));
        drop(reader);
    }

    #[test]
    fn test_prepare_main_page_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());

        assert!(store.prepare_main_page().unwrap());
        fs::write(store.main_page_path(), "customized").unwrap();
        assert!(!store.prepare_main_page().unwrap());

        let page = fs::read_to_string(store.main_page_path()).unwrap();
        assert_eq!(page, "customized");
    }

    #[test]
    fn test_prepare_main_page_fails_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("missing"));
        assert!(matches!(
            store.prepare_main_page(),
            Err(StoreError::MainPage { .. })
        ));
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()));
        let message = "x".repeat(900);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let message = message.clone();
                thread::spawn(move || {
                    for j in 0..25 {
                        store
                            .append(&post(&format!("user{i}-{j}"), &message))
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let content = fs::read_to_string(store.content_path()).unwrap();
        let mut expected_len = 0;
        for i in 0..8 {
            for j in 0..25 {
                let entry = render_entry(&post(&format!("user{i}-{j}"), &message));
                assert_eq!(content.matches(&entry).count(), 1);
                expected_len += entry.len();
            }
        }
        assert_eq!(content.len(), expected_len);
    }

    #[test]
    fn test_append_waits_for_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let holder = OpenOptions::new()
            .create(true)
            .append(true)
            .open(store.content_path())
            .unwrap();
        let lock = ExclusiveLock::acquire(&holder).unwrap();

        let writer = {
            let store = store.clone();
            thread::spawn(move || store.append(&post("alice", "waited")).unwrap())
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fs::metadata(store.content_path()).unwrap().len(), 0);

        drop(lock);
        let written = writer.join().unwrap();
        assert_eq!(
            fs::metadata(store.content_path()).unwrap().len(),
            written as u64
        );
    }
}
