//! Session workspace layout.
//!
//! `<session-root>/` holds one staged copy of the application tree
//! (`app/` by default), the shared `common.sh` helpers, and one numbered
//! directory per case. Acquisition is scoped: if any step fails, every
//! directory this call created is removed again.

use std::path::{Path, PathBuf};

use gauntlet_core::Session;

use crate::error::LayoutError;
use crate::scripts;

/// The on-disk shape of one session.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    pub root: PathBuf,
    /// The staged copy of the application tree.
    pub app_dir: PathBuf,
    /// Shared shell helpers sourced by every generated script.
    pub common_sh: PathBuf,
    /// Case directories, index order (`case_dirs[0]` is case 1).
    pub case_dirs: Vec<PathBuf>,
}

impl SessionLayout {
    /// Directory of the 1-based `index`.
    #[must_use]
    pub fn case_dir(&self, index: usize) -> Option<&Path> {
        self.case_dirs.get(index.checked_sub(1)?).map(PathBuf::as_path)
    }
}

/// The well-known files of one case directory. Per-phase logs and the
/// `result` file live under a subdirectory named after the session.
#[derive(Debug, Clone)]
pub struct CasePaths {
    pub case_dir: PathBuf,
    /// `<case>/<session-name>/`
    pub logs_dir: PathBuf,
    pub build_script: PathBuf,
    pub run_script: PathBuf,
    pub build_log: PathBuf,
    pub run_log: PathBuf,
    pub test_log: PathBuf,
    pub result_file: PathBuf,
    /// Where the build script leaves the kernel image.
    pub kernel: PathBuf,
}

impl CasePaths {
    #[must_use]
    pub fn new(case_dir: PathBuf, session_name: &str) -> Self {
        let logs_dir = case_dir.join(session_name);
        Self {
            build_script: case_dir.join("build"),
            run_script: case_dir.join("run"),
            build_log: logs_dir.join("build.log"),
            run_log: logs_dir.join("run.log"),
            test_log: logs_dir.join("test.log"),
            result_file: logs_dir.join("result"),
            kernel: case_dir.join("kernel"),
            logs_dir,
            case_dir,
        }
    }
}

/// Removes a freshly-created directory tree unless disarmed.
struct Rollback {
    path: PathBuf,
    armed: bool,
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), %err, "layout rollback failed");
            }
        }
    }
}

/// Create the session root, stage the application tree, write `common.sh`,
/// and create one numbered directory per case.
///
/// # Errors
/// Returns [`LayoutError::SourceMissing`] when `app_src` does not exist and
/// [`LayoutError::Io`] for any filesystem failure; on failure nothing this
/// call created is left behind.
pub fn create_layout(
    tests_dir: &Path,
    session: &Session,
    app_src: &Path,
    app_dir_name: &str,
    case_count: usize,
) -> Result<SessionLayout, LayoutError> {
    if !app_src.is_dir() {
        return Err(LayoutError::SourceMissing {
            path: app_src.to_owned(),
        });
    }

    let root = tests_dir.join(&session.name);
    let existed = root.is_dir();
    std::fs::create_dir_all(&root).map_err(|source| LayoutError::Io {
        path: root.clone(),
        source,
    })?;
    let mut rollback = Rollback {
        path: root.clone(),
        armed: !existed,
    };

    let app_dir = root.join(app_dir_name);
    copy_tree(app_src, &app_dir).map_err(|source| LayoutError::Io {
        path: app_dir.clone(),
        source,
    })?;

    let common_sh = root.join("common.sh");
    std::fs::write(&common_sh, scripts::COMMON_HELPERS).map_err(|source| LayoutError::Io {
        path: common_sh.clone(),
        source,
    })?;

    let mut case_dirs = Vec::with_capacity(case_count);
    for index in 1..=case_count {
        let dir = root.join(index.to_string());
        std::fs::create_dir_all(&dir).map_err(|source| LayoutError::Io {
            path: dir.clone(),
            source,
        })?;
        case_dirs.push(dir);
    }

    rollback.armed = false;
    tracing::info!(
        root = %root.display(),
        cases = case_count,
        "session workspace created"
    );
    Ok(SessionLayout {
        root,
        app_dir,
        common_sh,
        case_dirs,
    })
}

/// Recursively copy a directory tree, preserving symlinks.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&from)?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else if meta.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
