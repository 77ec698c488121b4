use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Default scratch directory for pipeline runs.
pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("voxrag")
}

/// Tracks every scratch file a run creates and deletes them on teardown.
///
/// Paths are registered before anything is written to them, so a file that
/// was only partially produced is still removed. `drain` is the normal
/// teardown path; `Drop` is a last resort for runs that never reach it.
pub struct TempResourceManager {
    dir: PathBuf,
    run_tag: String,
    tracked: Mutex<Vec<PathBuf>>,
}

impl TempResourceManager {
    pub fn new(dir: impl Into<PathBuf>, run_id: &str) -> Self {
        let tag: String = run_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();
        Self {
            dir: dir.into(),
            run_tag: if tag.is_empty() { "run".into() } else { tag },
            tracked: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a fresh, unique path and start tracking it.
    ///
    /// Nothing is created on disk except the scratch directory itself.
    pub fn allocate(&self, prefix: &str, ext: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let ext = ext.trim_start_matches('.');
        let path = loop {
            let name = format!(
                "{prefix}_{}_{}_{:08x}.{ext}",
                chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
                self.run_tag,
                rand::random::<u32>()
            );
            let candidate = self.dir.join(name);
            if !candidate.exists() && !self.is_tracked(&candidate) {
                break candidate;
            }
        };
        self.lock().push(path.clone());
        debug!(path = %path.display(), "temp_allocated");
        Ok(path)
    }

    /// Take ownership of a file created elsewhere, such as an upload.
    pub fn adopt(&self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        if !self.is_tracked(&path) {
            self.lock().push(path.clone());
        }
        path
    }

    /// Allocate a path and write `bytes` to it.
    pub async fn write(&self, prefix: &str, ext: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.allocate(prefix, ext)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Delete one tracked file now. Missing files are not an error.
    pub async fn release(&self, path: &Path) -> Result<()> {
        let removed = {
            let mut tracked = self.lock();
            let before = tracked.len();
            tracked.retain(|p| p != path);
            before != tracked.len()
        };
        if !removed {
            return Err(PipelineError::Internal(format!(
                "release of untracked temp file {}",
                path.display()
            )));
        }
        remove_quietly(path).await;
        Ok(())
    }

    /// Delete every tracked file. Returns how many paths were cleaned up.
    pub async fn drain(&self) -> usize {
        let paths = std::mem::take(&mut *self.lock());
        let count = paths.len();
        for path in &paths {
            remove_quietly(path).await;
        }
        if count > 0 {
            debug!(count, run = %self.run_tag, "temp_drained");
        }
        count
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.lock().iter().any(|p| p == path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        // A poisoned list is still the right list to clean up.
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TempResourceManager {
    fn drop(&mut self) {
        let paths = std::mem::take(&mut *self.lock());
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => warn!(path = %path.display(), "temp_removed_on_drop"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "temp_cleanup_failed"),
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "temp_cleanup_failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|rd| rd.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_allocate_names_are_unique_and_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let temps = TempResourceManager::new(dir.path(), "3f2a9c1e-0000-4000-8000-000000000000");
        let a = temps.allocate("normalized", "wav").unwrap();
        let b = temps.allocate("normalized", ".wav").unwrap();
        assert_ne!(a, b);

        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("normalized_"));
        assert!(name.contains("_3f2a9c1e_"));
        assert!(name.ends_with(".wav"));
        assert!(!b.to_str().unwrap().ends_with("..wav"));
        assert_eq!(temps.tracked_count(), 2);
    }

    #[tokio::test]
    async fn test_drain_removes_written_and_unwritten_paths() {
        let dir = tempfile::tempdir().unwrap();
        let temps = TempResourceManager::new(dir.path(), "run1");
        temps.write("upload", "mp3", b"abc").await.unwrap();
        temps.write("speech", "mp3", b"def").await.unwrap();
        // Reserved but never written, e.g. a conversion that died early.
        temps.allocate("normalized", "wav").unwrap();
        assert_eq!(file_count(dir.path()), 2);

        assert_eq!(temps.drain().await, 3);
        assert_eq!(file_count(dir.path()), 0);
        assert_eq!(temps.tracked_count(), 0);
        assert_eq!(temps.drain().await, 0);
    }

    #[tokio::test]
    async fn test_release_untracks_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let temps = TempResourceManager::new(dir.path(), "run2");
        let keep = temps.write("a", "wav", b"1").await.unwrap();
        let gone = temps.write("b", "wav", b"2").await.unwrap();

        temps.release(&gone).await.unwrap();
        assert!(!gone.exists());
        assert!(keep.exists());
        assert_eq!(temps.tracked_count(), 1);
        assert!(temps.release(&gone).await.is_err());
    }

    #[tokio::test]
    async fn test_adopt_external_file() {
        let dir = tempfile::tempdir().unwrap();
        let upload = dir.path().join("upload.m4a");
        std::fs::write(&upload, b"data").unwrap();

        let temps = TempResourceManager::new(dir.path().join("scratch"), "run3");
        temps.adopt(&upload);
        temps.adopt(&upload);
        assert_eq!(temps.tracked_count(), 1);
        temps.drain().await;
        assert!(!upload.exists());
    }

    #[tokio::test]
    async fn test_drop_cleans_up_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let temps = TempResourceManager::new(dir.path(), "run4");
            temps.write("speech", "mp3", b"x").await.unwrap();
            assert_eq!(file_count(dir.path()), 1);
        }
        assert_eq!(file_count(dir.path()), 0);
    }

    #[test]
    fn test_empty_run_id_gets_placeholder_tag() {
        let dir = tempfile::tempdir().unwrap();
        let temps = TempResourceManager::new(dir.path(), "--");
        let path = temps.allocate("x", "bin").unwrap();
        assert!(path.to_str().unwrap().contains("_run_"));
    }
}
