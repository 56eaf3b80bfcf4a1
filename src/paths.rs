use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::LayoutSettings;

/// Resolve the base directory of an extracted install.
///
/// Returns the first candidate (relative to `root`) that exists as a
/// directory. When none exists, returns the first candidate anyway so the
/// caller can report a concrete missing path. With no candidates at all the
/// root itself is the base.
pub fn resolve_base(root: &Path, candidates: &[PathBuf]) -> PathBuf {
    for candidate in candidates {
        let path = root.join(candidate);
        if path.is_dir() {
            return path;
        }
    }
    candidates
        .first()
        .map(|c| root.join(c))
        .unwrap_or_else(|| root.to_path_buf())
}

/// Paths derived from an install root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallPaths {
    pub root: PathBuf,
    pub base: PathBuf,
    pub launch_script: PathBuf,
    pub artifact: PathBuf,
    /// Whether `base` actually exists on disk.
    pub base_found: bool,
}

impl InstallPaths {
    pub fn resolve(root: &Path, layout: &LayoutSettings) -> Self {
        let base = resolve_base(root, &layout.candidates);
        Self {
            root: root.to_path_buf(),
            launch_script: base.join(&layout.launch_script),
            artifact: base.join(&layout.artifact),
            base_found: base.is_dir(),
            base,
        }
    }
}

/// A fully resolved command line plus working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub workdir: PathBuf,
}

impl LaunchCommand {
    pub fn new(program: impl Into<OsString>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Human-readable rendering for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

/// Build the platform start command for a launch script.
///
/// The working directory is always the script's own directory, which is
/// what portable bundles expect when they locate their embedded runtime.
pub fn launch_command(script: &Path) -> LaunchCommand {
    let workdir = script
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if cfg!(windows) {
        return LaunchCommand::new("cmd", workdir)
            .arg("/C")
            .arg(script.as_os_str());
    }

    match script.extension().and_then(|e| e.to_str()) {
        None | Some("sh") => {
            LaunchCommand::new("sh", workdir).arg(script.as_os_str())
        }
        Some(_) => LaunchCommand::new(script.as_os_str(), workdir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> LayoutSettings {
        LayoutSettings::default()
    }

    #[test]
    fn prefers_nested_layout_when_it_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp
            .path()
            .join("ComfyUI_windows_portable_nvidia")
            .join("ComfyUI_windows_portable");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(tmp.path().join("ComfyUI_windows_portable")).unwrap();

        let paths = InstallPaths::resolve(tmp.path(), &layout());
        assert_eq!(paths.base, nested);
        assert!(paths.base_found);
    }

    #[test]
    fn falls_back_to_direct_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let direct = tmp.path().join("ComfyUI_windows_portable");
        std::fs::create_dir_all(&direct).unwrap();

        let paths = InstallPaths::resolve(tmp.path(), &layout());
        assert_eq!(paths.base, direct);
        assert_eq!(paths.launch_script, direct.join("run_nvidia_gpu.bat"));
        assert_eq!(
            paths.artifact,
            direct.join("python_embeded").join("python.exe")
        );
    }

    #[test]
    fn returns_first_candidate_when_nothing_exists() {
        let tmp = tempfile::tempdir().unwrap();

        let paths = InstallPaths::resolve(tmp.path(), &layout());
        assert_eq!(
            paths.base,
            tmp.path()
                .join("ComfyUI_windows_portable_nvidia")
                .join("ComfyUI_windows_portable")
        );
        assert!(!paths.base_found);
    }

    #[test]
    fn empty_candidates_use_root() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(resolve_base(tmp.path(), &[]), tmp.path());
    }

    #[test]
    fn file_with_candidate_name_is_not_a_base() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ComfyUI_windows_portable"), "not a dir").unwrap();

        let base = resolve_base(tmp.path(), &layout().candidates);
        assert!(base.ends_with("ComfyUI_windows_portable_nvidia/ComfyUI_windows_portable"));
    }

    #[test]
    fn launch_command_runs_in_script_directory() {
        let cmd = launch_command(Path::new("/opt/app/portable/run.sh"));
        assert_eq!(cmd.workdir, PathBuf::from("/opt/app/portable"));
    }

    #[cfg(unix)]
    #[test]
    fn shell_scripts_run_through_sh() {
        let cmd = launch_command(Path::new("/opt/app/run.sh"));
        assert_eq!(cmd.program, OsString::from("sh"));
        assert_eq!(cmd.args, vec![OsString::from("/opt/app/run.sh")]);
        assert_eq!(cmd.display(), "sh /opt/app/run.sh");
    }

    #[cfg(unix)]
    #[test]
    fn other_executables_run_directly() {
        let cmd = launch_command(Path::new("/opt/app/launcher.py"));
        assert_eq!(cmd.program, OsString::from("/opt/app/launcher.py"));
        assert!(cmd.args.is_empty());
    }

    #[cfg(windows)]
    #[test]
    fn windows_uses_cmd() {
        let cmd = launch_command(Path::new(r"C:\app\run_nvidia_gpu.bat"));
        assert_eq!(cmd.program, OsString::from("cmd"));
        assert_eq!(cmd.args[0], OsString::from("/C"));
    }
}
