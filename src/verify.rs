//! Filesystem post-condition for first-run setup.
//!
//! The supervised runtime unpacks its embedded interpreter on first launch.
//! The presence of that interpreter is the authoritative success signal;
//! output heuristics only decide *when* to look.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LayoutSettings;
use crate::paths::InstallPaths;

#[derive(Debug, Error)]
#[error("failed to check completion artifact {}: {source}", path.display())]
pub struct VerificationError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Anything that can answer "is first-run setup done yet?".
pub trait ArtifactCheck {
    fn is_complete(&self) -> bool;
}

impl<F: Fn() -> bool> ArtifactCheck for F {
    fn is_complete(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct CompletionVerifier {
    layout: LayoutSettings,
}

impl CompletionVerifier {
    pub fn new(layout: LayoutSettings) -> Self {
        Self { layout }
    }

    pub fn artifact_path(&self, install_root: &Path) -> PathBuf {
        InstallPaths::resolve(install_root, &self.layout).artifact
    }

    /// Strict check: `Ok(false)` when absent, `Err` for any other I/O failure.
    pub fn check(&self, install_root: &Path) -> Result<bool, VerificationError> {
        let path = self.artifact_path(install_root);
        match std::fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(VerificationError { path, source }),
        }
    }

    /// Errors count as "not complete yet".
    pub fn exists(&self, install_root: &Path) -> bool {
        match self.check(install_root) {
            Ok(true) => {
                info!(
                    artifact = %self.artifact_path(install_root).display(),
                    "completion artifact verified"
                );
                true
            }
            Ok(false) => {
                debug!(
                    artifact = %self.artifact_path(install_root).display(),
                    "completion artifact not present"
                );
                false
            }
            Err(e) => {
                warn!("{e}; treating as not complete");
                false
            }
        }
    }

    /// Bind this verifier to one install root.
    pub fn for_install<'a>(&'a self, install_root: &'a Path) -> impl ArtifactCheck + 'a {
        move || self.exists(install_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn verifier() -> CompletionVerifier {
        CompletionVerifier::new(LayoutSettings::default())
    }

    fn make_artifact(base: &Path) {
        let dir = base.join("python_embeded");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("python.exe"), b"MZ").unwrap();
    }

    #[test]
    fn absent_artifact_is_not_complete() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!verifier().exists(tmp.path()));
        assert!(!verifier().check(tmp.path()).unwrap());
    }

    #[test]
    fn finds_artifact_in_nested_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp
            .path()
            .join("ComfyUI_windows_portable_nvidia")
            .join("ComfyUI_windows_portable");
        make_artifact(&base);
        assert!(verifier().exists(tmp.path()));
    }

    #[test]
    fn finds_artifact_in_direct_layout() {
        let tmp = tempfile::tempdir().unwrap();
        make_artifact(&tmp.path().join("ComfyUI_windows_portable"));
        assert!(verifier().exists(tmp.path()));
    }

    #[test]
    fn missing_install_root_is_not_complete() {
        assert!(!verifier().exists(Path::new("/nonexistent-dir/firstrun-install")));
    }

    #[test]
    fn closure_and_bound_checks_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let v = verifier();
        let bound = v.for_install(tmp.path());
        assert!(!bound.is_complete());

        make_artifact(&tmp.path().join("ComfyUI_windows_portable"));
        assert!(bound.is_complete());

        let always = || true;
        assert!(always.is_complete());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_parent_is_treated_as_not_complete() {
        use std::os::unix::fs::PermissionsExt;

        // Root ignores permission bits, so this only proves something for
        // ordinary users.
        if unsafe { libc::geteuid() } == 0 {
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("ComfyUI_windows_portable");
        make_artifact(&base);
        let locked = base.join("python_embeded");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let v = verifier();
        assert!(v.check(tmp.path()).is_err());
        assert!(!v.exists(tmp.path()));

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
