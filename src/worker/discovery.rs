use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use super::bundle::CLI_COMMAND_VAR;
use super::process::{CommandRunner, CommandSpec, StdCommandRunner};

pub const CLI_BINARY: &str = "darktable-cli";
pub const FLATPAK_BINARY: &str = "flatpak";
pub const FLATPAK_APP_ID: &str = "org.darktable.Darktable";
const CORE_LIBRARY: &str = "libdarktable.so";
const DEEP_SCAN_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliLocation {
    Override(String),
    OnPath(PathBuf),
    Flatpak,
    Bundle(PathBuf),
}

impl CliLocation {
    pub fn command_line(&self) -> String {
        match self {
            Self::Override(value) => value.clone(),
            Self::OnPath(path) | Self::Bundle(path) => path.display().to_string(),
            Self::Flatpak => {
                format!("{FLATPAK_BINARY} run --command={CLI_BINARY} {FLATPAK_APP_ID}")
            }
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            Self::Override(_) => "env",
            Self::OnPath(_) => "path",
            Self::Flatpak => "flatpak",
            Self::Bundle(_) => "appimage",
        }
    }
}

/// Looks for a runnable catalog CLI. Every input that depends on the host
/// (PATH, home, cwd, env override, flatpak prefixes) is a field so the
/// search can be pointed at a fake tree.
pub struct CliDiscovery<R = StdCommandRunner> {
    runner: R,
    path_var: Option<OsString>,
    home: Option<PathBuf>,
    cwd: Option<PathBuf>,
    override_command: Option<String>,
    flatpak_prefixes: Vec<PathBuf>,
}

impl CliDiscovery<StdCommandRunner> {
    pub fn from_env() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let mut flatpak_prefixes = Vec::new();
        if let Some(home) = home.as_ref() {
            flatpak_prefixes.push(
                home.join(".local/share/flatpak/app")
                    .join(FLATPAK_APP_ID)
                    .join("current/active/files"),
            );
        }
        flatpak_prefixes.push(
            PathBuf::from("/var/lib/flatpak/app")
                .join(FLATPAK_APP_ID)
                .join("current/active/files"),
        );

        Self {
            runner: StdCommandRunner,
            path_var: std::env::var_os("PATH"),
            home,
            cwd: std::env::current_dir().ok(),
            override_command: std::env::var(CLI_COMMAND_VAR)
                .ok()
                .filter(|value| !value.trim().is_empty()),
            flatpak_prefixes,
        }
    }
}

impl<R: CommandRunner> CliDiscovery<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            path_var: None,
            home: None,
            cwd: None,
            override_command: None,
            flatpak_prefixes: Vec::new(),
        }
    }

    pub fn with_path_var(mut self, path_var: impl Into<OsString>) -> Self {
        self.path_var = Some(path_var.into());
        self
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_override(mut self, command: impl Into<String>) -> Self {
        self.override_command = Some(command.into());
        self
    }

    pub fn with_flatpak_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.flatpak_prefixes.push(prefix.into());
        self
    }

    pub fn discover(&self) -> Option<CliLocation> {
        if let Some(value) = self.override_command.as_ref() {
            return Some(CliLocation::Override(value.clone()));
        }
        if let Some(path) = find_on_path(CLI_BINARY, self.path_var.as_deref()) {
            return Some(CliLocation::OnPath(path));
        }
        if self.flatpak_available() {
            return Some(CliLocation::Flatpak);
        }
        self.find_bundle().map(CliLocation::Bundle)
    }

    pub fn flatpak_available(&self) -> bool {
        if find_on_path(FLATPAK_BINARY, self.path_var.as_deref()).is_none() {
            return false;
        }

        let spec = CommandSpec::new(FLATPAK_BINARY, &["info", FLATPAK_APP_ID]);
        match self.runner.run(&spec) {
            Ok(output) if output.status_code == 0 => return true,
            Ok(output) => debug!(status = output.status_code, "flatpak info did not find the app"),
            Err(error) => debug!(%error, "flatpak info failed"),
        }

        self.flatpak_prefixes.iter().any(|prefix| {
            prefix.join("lib").join(CORE_LIBRARY).exists()
                || prefix.join("lib64").join(CORE_LIBRARY).exists()
        })
    }

    /// Known exact locations first, then a deep scan of the working dir and
    /// app folders, then a shallow scan of Downloads and ~/bin.
    pub fn find_bundle(&self) -> Option<PathBuf> {
        let mut deep = Vec::new();
        let mut shallow = Vec::new();
        if let Some(home) = self.home.as_ref() {
            for known in ["Apps/Darktable/Darktable.AppImage", "Apps/Darktable.AppImage"] {
                let candidate = home.join(known);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        if let Some(cwd) = self.cwd.as_ref() {
            deep.push(cwd.clone());
        }
        if let Some(home) = self.home.as_ref() {
            deep.push(home.join("Apps"));
            deep.push(home.join("Applications"));
            shallow.push(home.join("Downloads"));
            shallow.push(home.join("bin"));
        }

        let scans = deep
            .into_iter()
            .map(|dir| (dir, DEEP_SCAN_DEPTH))
            .chain(shallow.into_iter().map(|dir| (dir, 1)));
        for (dir, depth) in scans {
            if !dir.is_dir() {
                continue;
            }
            if let Some(found) = scan_for_bundle(&dir, depth) {
                return Some(fs::canonicalize(&found).unwrap_or(found));
            }
        }
        None
    }

    /// Resolved location per binary; `darktable-cli` goes through the full
    /// discovery chain, everything else through PATH.
    pub fn dependency_status(&self, binaries: &[&str]) -> BTreeMap<String, Option<String>> {
        binaries
            .iter()
            .map(|name| {
                let location = if *name == CLI_BINARY {
                    self.discover().map(|location| location.command_line())
                } else {
                    find_on_path(name, self.path_var.as_deref())
                        .map(|path| path.display().to_string())
                };
                ((*name).to_string(), location)
            })
            .collect()
    }
}

fn scan_for_bundle(dir: &Path, max_depth: usize) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() || entry.path_is_symlink())
        .find(|entry| is_bundle_name(entry.file_name()))
        .map(|entry| entry.into_path())
}

fn is_bundle_name(name: &OsStr) -> bool {
    let name = name.to_string_lossy().to_ascii_lowercase();
    name.contains("darktable") && name.ends_with(".appimage")
}

/// First executable named `name` on `path_var`. Names containing a path
/// separator are checked as given.
pub fn find_on_path(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }
    let path_var = path_var?;
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
