use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::discovery::find_on_path;
use super::process::{spawn_line_pump, terminate_child, LineReceiver};
use super::WorkerLaunch;

pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";
pub const CORE_LIBRARY_VAR: &str = "DARKTABLE_LIB_PATH";
pub const CLI_COMMAND_VAR: &str = "DARKTABLE_CLI_CMD";
pub const REEXEC_GUARD_VAR: &str = "DT_MCP_LD_REEXEC";

/// Where things live inside a mounted bundle, and how to mount it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    pub app_name: String,
    pub core_library: String,
    pub arch_triplet: String,
    pub interpreter: String,
    pub bundled_interpreters: Vec<String>,
    pub host_interpreter_fallback: Option<String>,
    pub mount_flag: String,
    pub mount_timeout: Duration,
    pub unmount_grace: Duration,
}

impl Default for BundleLayout {
    fn default() -> Self {
        Self {
            app_name: String::from("darktable"),
            core_library: String::from("libdarktable.so"),
            arch_triplet: String::from("x86_64-linux-gnu"),
            interpreter: String::from("lua"),
            bundled_interpreters: vec![String::from("usr/bin/lua"), String::from("usr/bin/luajit")],
            host_interpreter_fallback: Some(String::from("lua5.4")),
            mount_flag: String::from("--appimage-mount"),
            mount_timeout: Duration::from_secs(15),
            unmount_grace: Duration::from_secs(2),
        }
    }
}

impl BundleLayout {
    pub fn library_dirs(&self, mount_point: &Path) -> Vec<PathBuf> {
        let app = self.app_name.as_str();
        let triplet = self.arch_triplet.as_str();
        [
            String::from("usr/lib"),
            format!("usr/lib/{app}"),
            format!("usr/lib/{triplet}"),
            format!("usr/lib/{triplet}/{app}"),
            String::from("usr/lib64"),
            format!("usr/lib64/{app}"),
        ]
        .iter()
        .map(|rel| mount_point.join(rel))
        .collect()
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to start mount helper for '{bundle}': {source}")]
    Spawn {
        bundle: String,
        #[source]
        source: io::Error,
    },
    #[error("mount helper for '{bundle}' exited without reporting a mount point")]
    NoMountPoint { bundle: String },
    #[error("mount helper for '{bundle}' did not report a mount point within {}s", .timeout.as_secs())]
    MountTimeout { bundle: String, timeout: Duration },
    #[error("mount point '{path}' reported by the helper is not a directory")]
    InvalidMountPoint { path: String },
    #[error("failed to read mount helper output: {0}")]
    Io(#[source] io::Error),
}

/// A bundle mounted by its own helper process. The helper keeps the mount
/// alive; terminating it unmounts. Unmounting happens once, on `unmount` or
/// on drop, whichever comes first.
pub struct MountedBundle {
    bundle_path: PathBuf,
    mount_point: PathBuf,
    helper: Option<Child>,
    grace: Duration,
    // Keeps the helper's stdout drained so it never blocks on a full pipe.
    _helper_stdout: Option<LineReceiver>,
}

impl fmt::Debug for MountedBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountedBundle")
            .field("bundle_path", &self.bundle_path)
            .field("mount_point", &self.mount_point)
            .field("helper_pid", &self.helper.as_ref().map(Child::id))
            .finish()
    }
}

impl MountedBundle {
    pub fn mount(bundle: &Path, layout: &BundleLayout) -> Result<Self, BundleError> {
        let bundle_label = bundle.display().to_string();
        let mut helper = Command::new(bundle)
            .arg(layout.mount_flag.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| BundleError::Spawn {
                bundle: bundle_label.clone(),
                source,
            })?;

        let Some(stdout) = helper.stdout.take() else {
            terminate_child(&mut helper, layout.unmount_grace, false);
            return Err(BundleError::Io(io::Error::other("mount helper stdout unavailable")));
        };
        let (lines, _pump) = match spawn_line_pump(stdout, "bundle-mount") {
            Ok(pump) => pump,
            Err(error) => {
                terminate_child(&mut helper, layout.unmount_grace, false);
                return Err(BundleError::Io(error));
            }
        };

        let first_line = match lines.recv_timeout(layout.mount_timeout) {
            Ok(Ok(line)) => Ok(line.trim().to_string()),
            Ok(Err(error)) => Err(BundleError::Io(error)),
            Err(RecvTimeoutError::Timeout) => Err(BundleError::MountTimeout {
                bundle: bundle_label.clone(),
                timeout: layout.mount_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(BundleError::NoMountPoint {
                bundle: bundle_label.clone(),
            }),
        };
        let mount_point = match first_line {
            Ok(line) if line.is_empty() => Err(BundleError::NoMountPoint {
                bundle: bundle_label.clone(),
            }),
            Ok(line) if !Path::new(&line).is_dir() => {
                Err(BundleError::InvalidMountPoint { path: line })
            }
            Ok(line) => Ok(PathBuf::from(line)),
            Err(error) => Err(error),
        };
        let mount_point = match mount_point {
            Ok(mount_point) => mount_point,
            Err(error) => {
                terminate_child(&mut helper, layout.unmount_grace, false);
                return Err(error);
            }
        };

        info!(
            bundle = %bundle.display(),
            mount_point = %mount_point.display(),
            helper_pid = helper.id(),
            "bundle mounted"
        );
        Ok(Self {
            bundle_path: bundle.to_path_buf(),
            mount_point,
            helper: Some(helper),
            grace: layout.unmount_grace,
            _helper_stdout: Some(lines),
        })
    }

    pub fn bundle_path(&self) -> &Path {
        self.bundle_path.as_path()
    }

    pub fn mount_point(&self) -> &Path {
        self.mount_point.as_path()
    }

    pub fn is_mounted(&self) -> bool {
        self.helper.is_some()
    }

    pub fn unmount(&mut self) {
        let Some(mut helper) = self.helper.take() else {
            return;
        };
        debug!(mount_point = %self.mount_point.display(), "unmounting bundle");
        terminate_child(&mut helper, self.grace, false);
        self._helper_stdout = None;
    }
}

impl Drop for MountedBundle {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEnvironment {
    pub env: HashMap<String, String>,
    pub core_library: Option<PathBuf>,
}

/// Derives the worker environment for a mounted bundle from `base_env`.
/// Library directories are listed whether or not they exist; the loader
/// ignores the missing ones.
pub fn compute_bundle_environment(
    mount_point: &Path,
    bundle_path: &Path,
    layout: &BundleLayout,
    mut base_env: HashMap<String, String>,
) -> BundleEnvironment {
    let mut library_path = layout
        .library_dirs(mount_point)
        .iter()
        .map(|dir| dir.display().to_string())
        .collect::<Vec<_>>();
    if let Some(existing) = base_env.get(LIBRARY_PATH_VAR).filter(|value| !value.is_empty()) {
        library_path.push(existing.clone());
    }
    base_env.insert(String::from(LIBRARY_PATH_VAR), library_path.join(":"));

    let core_library = locate_core_library(mount_point, layout);
    match core_library.as_ref() {
        Some(path) => {
            base_env.insert(String::from(CORE_LIBRARY_VAR), path.display().to_string());
        }
        None => warn!(
            mount_point = %mount_point.display(),
            library = %layout.core_library,
            "core library not found inside bundle"
        ),
    }

    base_env.insert(String::from(CLI_COMMAND_VAR), bundle_path.display().to_string());
    base_env.insert(String::from(REEXEC_GUARD_VAR), String::from("1"));

    BundleEnvironment {
        env: base_env,
        core_library,
    }
}

pub fn locate_core_library(mount_point: &Path, layout: &BundleLayout) -> Option<PathBuf> {
    for rel in ["usr/lib", "usr/lib64"] {
        let candidate = mount_point.join(rel).join(layout.core_library.as_str());
        if candidate.exists() {
            return Some(candidate);
        }
    }

    debug!(mount_point = %mount_point.display(), "searching bundle for core library");
    WalkDir::new(mount_point)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_name() == OsStr::new(layout.core_library.as_str()))
        .map(|entry| entry.into_path())
}

/// Replacement for `command[0]` when it names the configured interpreter:
/// a bundled interpreter first, then the host fallback on `path_var`.
pub fn rewrite_interpreter(
    command: &[String],
    mount_point: &Path,
    layout: &BundleLayout,
    path_var: Option<&OsStr>,
) -> Option<String> {
    let program = command.first()?;
    if program != &layout.interpreter {
        return None;
    }

    let bundled = layout
        .bundled_interpreters
        .iter()
        .map(|rel| mount_point.join(rel))
        .find(|candidate| candidate.is_file());
    if let Some(path) = bundled {
        info!(interpreter = %path.display(), "using bundled interpreter");
        return Some(path.display().to_string());
    }

    let fallback = layout.host_interpreter_fallback.as_deref()?;
    let host = find_on_path(fallback, path_var)?;
    info!(interpreter = %host.display(), "using host interpreter for ABI compatibility");
    Some(host.display().to_string())
}

pub fn looks_like_bundle(program: &str) -> bool {
    program.to_ascii_lowercase().contains(".appimage")
}

#[derive(Debug, Clone, Default)]
pub struct ProcessEnvironmentResolver {
    layout: BundleLayout,
}

impl ProcessEnvironmentResolver {
    pub fn new(layout: BundleLayout) -> Self {
        Self { layout }
    }

    pub fn bundle_target(&self, command: &[String], explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        command
            .first()
            .filter(|program| looks_like_bundle(program))
            .map(PathBuf::from)
    }

    /// Never fails: without a bundle, or when mounting goes wrong, the
    /// command runs as given with the caller's environment.
    pub fn resolve(&self, command: Vec<String>, explicit_bundle: Option<&Path>) -> WorkerLaunch {
        let Some(target) = self.bundle_target(&command, explicit_bundle) else {
            return WorkerLaunch::plain(command);
        };
        info!(bundle = %target.display(), "bundle detected");
        match self.augment(&target, &command) {
            Some(launch) => launch,
            None => WorkerLaunch::plain(command),
        }
    }

    fn augment(&self, target: &Path, command: &[String]) -> Option<WorkerLaunch> {
        let bundle = match MountedBundle::mount(target, &self.layout) {
            Ok(bundle) => bundle,
            Err(error) => {
                warn!(bundle = %target.display(), %error, "bundle mount failed; using plain environment");
                return None;
            }
        };

        let environment = compute_bundle_environment(
            bundle.mount_point(),
            target,
            &self.layout,
            inherited_environment(),
        );
        let mut command = command.to_vec();
        let path_var = std::env::var_os("PATH");
        if let Some(interpreter) =
            rewrite_interpreter(&command, bundle.mount_point(), &self.layout, path_var.as_deref())
        {
            command[0] = interpreter;
        }

        Some(WorkerLaunch {
            command,
            env: Some(environment.env),
            cwd: None,
            bundle: Some(bundle),
        })
    }
}

fn inherited_environment() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    fn temp_root(prefix: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("shutter_bundle_{prefix}_{stamp}"));
        fs::create_dir_all(&root).expect("temp root should be created");
        root
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("file should have a parent"))
            .expect("parent should be created");
        fs::write(path, b"").expect("file should be written");
    }

    #[test]
    fn environment_prepends_library_dirs_and_sets_markers() {
        let mount = temp_root("env");
        touch(&mount.join("usr/lib64/libdarktable.so"));
        let base = HashMap::from([
            (String::from("LD_LIBRARY_PATH"), String::from("/opt/existing")),
            (String::from("HOME"), String::from("/home/tester")),
        ]);

        let env = compute_bundle_environment(
            &mount,
            Path::new("/apps/Darktable.AppImage"),
            &BundleLayout::default(),
            base,
        );

        let m = mount.display();
        assert_eq!(
            env.env.get(LIBRARY_PATH_VAR).map(String::as_str),
            Some(
                format!(
                    "{m}/usr/lib:{m}/usr/lib/darktable:{m}/usr/lib/x86_64-linux-gnu:\
                     {m}/usr/lib/x86_64-linux-gnu/darktable:{m}/usr/lib64:{m}/usr/lib64/darktable:\
                     /opt/existing"
                )
                .as_str()
            )
        );
        assert_eq!(
            env.core_library,
            Some(mount.join("usr/lib64/libdarktable.so"))
        );
        assert_eq!(
            env.env.get(CLI_COMMAND_VAR).map(String::as_str),
            Some("/apps/Darktable.AppImage")
        );
        assert_eq!(env.env.get(REEXEC_GUARD_VAR).map(String::as_str), Some("1"));
        assert_eq!(env.env.get("HOME").map(String::as_str), Some("/home/tester"));

        let _ = fs::remove_dir_all(mount);
    }

    #[test]
    fn core_library_falls_back_to_recursive_search() {
        let mount = temp_root("deep");
        let nested = mount.join("opt/darktable/lib/libdarktable.so");
        touch(&nested);

        let env = compute_bundle_environment(
            &mount,
            Path::new("/apps/dt.AppImage"),
            &BundleLayout::default(),
            HashMap::new(),
        );

        assert_eq!(env.core_library, Some(nested.clone()));
        assert_eq!(
            env.env.get(CORE_LIBRARY_VAR).map(String::as_str),
            Some(nested.display().to_string().as_str())
        );
        assert!(!env
            .env
            .get(LIBRARY_PATH_VAR)
            .expect("library path should be set")
            .ends_with(':'));

        let _ = fs::remove_dir_all(mount);
    }

    #[test]
    fn interpreter_prefers_bundled_lua_then_luajit() {
        let mount = temp_root("lua");
        let layout = BundleLayout::default();
        let command = vec![String::from("lua"), String::from("server/dt_mcp_server.lua")];

        touch(&mount.join("usr/bin/luajit"));
        assert_eq!(
            rewrite_interpreter(&command, &mount, &layout, Some(OsStr::new(""))),
            Some(mount.join("usr/bin/luajit").display().to_string())
        );

        touch(&mount.join("usr/bin/lua"));
        assert_eq!(
            rewrite_interpreter(&command, &mount, &layout, Some(OsStr::new(""))),
            Some(mount.join("usr/bin/lua").display().to_string())
        );

        let other = vec![String::from("python3"), String::from("server.py")];
        assert_eq!(rewrite_interpreter(&other, &mount, &layout, None), None);

        let _ = fs::remove_dir_all(mount);
    }

    #[cfg(unix)]
    #[test]
    fn interpreter_falls_back_to_host_lua54_on_path() {
        use std::os::unix::fs::PermissionsExt;

        let mount = temp_root("hostlua_mount");
        let bin = temp_root("hostlua_bin");
        let host_lua = bin.join("lua5.4");
        touch(&host_lua);
        fs::set_permissions(&host_lua, fs::Permissions::from_mode(0o755))
            .expect("permissions should be set");

        let command = vec![String::from("lua"), String::from("server.lua")];
        let rewritten = rewrite_interpreter(
            &command,
            &mount,
            &BundleLayout::default(),
            Some(bin.as_os_str()),
        );

        assert_eq!(rewritten, Some(host_lua.display().to_string()));

        let _ = fs::remove_dir_all(mount);
        let _ = fs::remove_dir_all(bin);
    }

    #[test]
    fn bundle_target_prefers_explicit_path_over_command() {
        let resolver = ProcessEnvironmentResolver::default();
        let command = vec![String::from("/apps/Darktable-4.8.AppImage")];

        assert_eq!(
            resolver.bundle_target(&command, Some(Path::new("/explicit/dt.AppImage"))),
            Some(PathBuf::from("/explicit/dt.AppImage"))
        );
        assert_eq!(
            resolver.bundle_target(&command, None),
            Some(PathBuf::from("/apps/Darktable-4.8.AppImage"))
        );
        assert_eq!(
            resolver.bundle_target(&[String::from("lua")], None),
            None
        );
    }

    #[test]
    fn resolve_degrades_to_plain_launch_when_mount_fails() {
        let resolver = ProcessEnvironmentResolver::default();
        let launch = resolver.resolve(
            vec![String::from("lua"), String::from("server.lua")],
            Some(Path::new("/nonexistent/shutter/Darktable.AppImage")),
        );

        assert!(launch.env.is_none());
        assert!(launch.bundle.is_none());
        assert_eq!(launch.command, vec!["lua", "server.lua"]);
    }

    #[cfg(unix)]
    fn fake_mount_helper(root: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = root.join("Darktable.AppImage");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("helper should be written");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
            .expect("permissions should be set");
        script
    }

    #[cfg(unix)]
    #[test]
    fn mount_reads_first_line_and_unmount_stops_helper() {
        let root = temp_root("helper");
        let mount_dir = root.join("mnt");
        fs::create_dir_all(&mount_dir).expect("mount dir should be created");
        let helper = fake_mount_helper(
            &root,
            &format!("echo '{}'\nexec sleep 30", mount_dir.display()),
        );

        let mut bundle = MountedBundle::mount(&helper, &BundleLayout::default())
            .expect("fake bundle should mount");
        assert_eq!(bundle.mount_point(), mount_dir.as_path());
        assert!(bundle.is_mounted());

        let started = Instant::now();
        bundle.unmount();
        bundle.unmount();
        assert!(!bundle.is_mounted());
        assert!(started.elapsed() < Duration::from_secs(2));

        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn mount_rejects_helper_without_mount_point() {
        let root = temp_root("silent");
        let helper = fake_mount_helper(&root, "exit 0");

        let err = MountedBundle::mount(&helper, &BundleLayout::default())
            .expect_err("helper without output should fail");
        assert!(matches!(err, BundleError::NoMountPoint { .. }));

        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn resolve_mounts_bundle_and_rewrites_interpreter() {
        let root = temp_root("resolve");
        let mount_dir = root.join("mnt");
        touch(&mount_dir.join("usr/bin/lua"));
        touch(&mount_dir.join("usr/lib/libdarktable.so"));
        let helper = fake_mount_helper(
            &root,
            &format!("echo '{}'\nexec sleep 30", mount_dir.display()),
        );

        let launch = ProcessEnvironmentResolver::default().resolve(
            vec![String::from("lua"), String::from("server.lua")],
            Some(&helper),
        );

        assert_eq!(launch.command[0], mount_dir.join("usr/bin/lua").display().to_string());
        let env = launch.env.as_ref().expect("environment should be augmented");
        assert_eq!(
            env.get(CORE_LIBRARY_VAR).map(String::as_str),
            Some(mount_dir.join("usr/lib/libdarktable.so").display().to_string().as_str())
        );
        let mut bundle = launch.bundle.expect("bundle should be owned by the launch");
        assert!(bundle.is_mounted());
        bundle.unmount();

        let _ = fs::remove_dir_all(root);
    }
}
