//! Worker process launching.
//!
//! [`ProcessLauncher`] is the seam between the fork controller and the OS. The
//! production [`ExecLauncher`] re-executes a program (normally the current binary) with
//! the worker environment and one end of a fresh control channel at fd 3.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::FutureExt;
use futures::future::BoxFuture;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::dup2_raw;
use tokio::process::Command;

use super::table::{Pid, WorkerExit};
use crate::bridge::{ControlChannel, INHERITED_FD};
use crate::role::{ForkReason, WorkerEnv};

/// What the fork controller asks a launcher for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub reason: ForkReason,
    pub master_pid: u32,
}

impl LaunchRequest {
    pub fn env(&self) -> WorkerEnv {
        WorkerEnv {
            reason: self.reason,
            master_pid: self.master_pid,
        }
    }
}

/// A successfully started worker.
pub struct LaunchedWorker {
    pub pid: Pid,
    /// The master's end of the control channel.
    pub channel: ControlChannel,
    /// Resolves once the OS reports the process exited.
    pub exit: BoxFuture<'static, io::Result<WorkerExit>>,
}

impl std::fmt::Debug for LaunchedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedWorker")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to create control channel: {0}")]
    Channel(#[source] io::Error),
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker process exited before its pid could be read")]
    NoPid,
}

/// Extension point for how worker processes are started.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker, LaunchError>;
}

/// Launches workers by executing `program` with `args`.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExecLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-execute the running binary with the arguments it was started with.
    ///
    /// The program is `argv[0]` as invoked, made absolute against the startup directory
    /// or `PATH` but not canonicalized, so swapping a `current -> vN` symlink makes the
    /// next generation run the new build. Falls back to the kernel's view of the running
    /// executable when `argv[0]` names nothing runnable.
    pub fn current_exe() -> io::Result<Self> {
        let mut argv = std::env::args_os();
        let arg0 = argv.next();
        let cwd = std::env::current_dir().ok();
        let path = std::env::var_os("PATH");

        let program = match resolve_program(arg0.as_deref(), cwd.as_deref(), path.as_deref()) {
            Some(program) => program,
            None => {
                let exe = std::env::current_exe()?;
                tracing::debug!(?arg0, exe = %exe.display(), "argv[0] not resolvable, re-executing current_exe");
                exe
            }
        };
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ProcessLauncher for ExecLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker, LaunchError> {
        let (master_end, child_end) = ControlChannel::std_pair().map_err(LaunchError::Channel)?;
        let child_fd = child_end.as_raw_fd();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(request.env().vars())
            .stdin(Stdio::null());

        // SAFETY: the hook runs in the forked child before exec and only calls
        // async-signal-safe fcntl/dup2 on descriptors we own.
        unsafe {
            cmd.pre_exec(move || inherit_control_fd(child_fd));
        }

        tracing::debug!(program = %self.program.display(), reason = %request.reason, "Spawning worker process");
        let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;
        // The child holds its own copy now.
        drop(child_end);

        let pid = child.id().ok_or(LaunchError::NoPid)?;
        let channel = ControlChannel::from_std(master_end).map_err(LaunchError::Channel)?;
        let exit = async move { child.wait().await.map(WorkerExit::from_status) }.boxed();

        Ok(LaunchedWorker { pid, channel, exit })
    }
}

/// Find the file `arg0` names the way a shell would: a name with a slash is taken
/// relative to `cwd`, a bare name is looked up in `path`. Symlinks are left in place.
fn resolve_program(arg0: Option<&OsStr>, cwd: Option<&Path>, path: Option<&OsStr>) -> Option<PathBuf> {
    let arg0 = Path::new(arg0.filter(|a| !a.is_empty())?);
    if arg0.components().count() > 1 || arg0.is_absolute() {
        let candidate = if arg0.is_absolute() {
            arg0.to_path_buf()
        } else {
            cwd?.join(arg0)
        };
        return is_executable(&candidate).then_some(candidate);
    }

    std::env::split_paths(path?)
        .map(|dir| match cwd {
            Some(cwd) if dir.is_relative() => cwd.join(dir).join(arg0),
            _ => dir.join(arg0),
        })
        .find(|candidate| candidate.is_absolute() && is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Place `fd` at [`INHERITED_FD`] without close-on-exec. Runs between fork and exec.
fn inherit_control_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is the child's end of the socketpair, held open by the launcher
    // until after spawn returns.
    let source = unsafe { BorrowedFd::borrow_raw(fd) };
    if fd == INHERITED_FD {
        // dup2 onto itself is a no-op and would leave FD_CLOEXEC set.
        let mut flags = FdFlag::from_bits_retain(fcntl(source, FcntlArg::F_GETFD)?);
        flags.remove(FdFlag::FD_CLOEXEC);
        fcntl(source, FcntlArg::F_SETFD(flags))?;
    } else {
        // SAFETY: the slot belongs to this child and is overwritten on purpose. The
        // returned owner is released so the descriptor survives into exec.
        let placed = unsafe { dup2_raw(source, INHERITED_FD) }?;
        let _ = placed.into_raw_fd();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ControlMessage, MessageType};
    use futures::StreamExt;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn sh(script: &str) -> ExecLauncher {
        ExecLauncher::new("/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn exec_launcher_passes_env_and_control_fd() {
        // Checks the environment, then writes a Takeover frame (tag 1, empty payload)
        // to fd 3.
        let launcher = sh(r#"
            test "$HANDOFF_WORKER" = 1 || exit 11
            test "$HANDOFF_FORK_REASON" = reload || exit 12
            test "$HANDOFF_MASTER_PID" = 4242 || exit 13
            printf '\001\000\000\000\000' >&3 || exit 14
            exit 0
        "#);
        let request = LaunchRequest {
            reason: ForkReason::Reload,
            master_pid: 4242,
        };

        let worker = launcher.launch(&request).unwrap();
        assert!(worker.pid > 0);

        let (mut reader, _writer) = worker.channel.split();
        let msg = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind, MessageType::Takeover);
        assert!(msg.value.is_empty());

        let exit = tokio::time::timeout(Duration::from_secs(5), worker.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Success);
    }

    #[tokio::test]
    async fn exec_launcher_reports_nonzero_exit() {
        let worker = sh("exit 3")
            .launch(&LaunchRequest {
                reason: ForkReason::Start,
                master_pid: 1,
            })
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), worker.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Failure(Some(3)));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = ExecLauncher::new("/nonexistent/handoff-worker")
            .launch(&LaunchRequest {
                reason: ForkReason::Start,
                master_pid: 1,
            })
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)));
    }

    fn executable(path: &Path) {
        std::fs::write(path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn argv0_keeps_release_symlink() {
        let dir = tempfile::tempdir().unwrap();
        executable(&dir.path().join("v1"));
        executable(&dir.path().join("v2"));
        let current = dir.path().join("current");
        std::os::unix::fs::symlink("v1", &current).unwrap();

        let program =
            resolve_program(Some(OsStr::new("./current")), Some(dir.path()), None).unwrap();
        assert_eq!(program, current);

        // A deploy repoints the link; the resolved program follows it.
        std::fs::remove_file(&current).unwrap();
        std::os::unix::fs::symlink("v2", &current).unwrap();
        assert_eq!(
            std::fs::canonicalize(&program).unwrap(),
            std::fs::canonicalize(dir.path().join("v2")).unwrap()
        );
    }

    #[test]
    fn bare_argv0_is_looked_up_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let shadow = dir.path().join("shadow");
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&shadow).unwrap();
        std::fs::create_dir_all(&bin).unwrap();
        // Not executable, so the lookup moves on.
        std::fs::write(shadow.join("app"), "").unwrap();
        executable(&bin.join("app"));

        let path = std::env::join_paths([&shadow, &bin]).unwrap();
        let program = resolve_program(Some(OsStr::new("app")), None, Some(&path)).unwrap();
        assert_eq!(program, bin.join("app"));
    }

    #[test]
    fn unusable_argv0_is_not_resolved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain"), "").unwrap();

        assert_eq!(resolve_program(None, Some(dir.path()), None), None);
        assert_eq!(resolve_program(Some(OsStr::new("")), Some(dir.path()), None), None);
        assert_eq!(
            resolve_program(Some(OsStr::new("./missing")), Some(dir.path()), None),
            None
        );
        assert_eq!(
            resolve_program(Some(OsStr::new("./plain")), Some(dir.path()), None),
            None
        );
        assert_eq!(resolve_program(Some(OsStr::new("./plain")), None, None), None);
        assert_eq!(resolve_program(Some(OsStr::new("app")), None, None), None);
    }

    #[test]
    fn current_exe_resolves_to_an_absolute_program() {
        let launcher = ExecLauncher::current_exe().unwrap();
        assert!(launcher.program().is_absolute());
        assert!(is_executable(launcher.program()));
    }

    /// Child half of `reexecuted_worker_shares_listener_and_channel`. Does nothing
    /// unless started as a worker.
    #[tokio::test]
    async fn reexecuted_worker_side() {
        if !crate::role::is_worker() {
            return;
        }
        let (mut reader, mut writer) = ControlChannel::inherit().unwrap().split();
        let msg = reader.next().await.unwrap().unwrap();
        let addr: SocketAddr = std::str::from_utf8(&msg.value).unwrap().parse().unwrap();

        let listener = crate::socket::bind(addr).unwrap();
        let bound = listener.local_addr().unwrap().to_string();
        crate::bridge::channel::send(&mut writer, ControlMessage::takeover().with_value(bound))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reexecuted_worker_shares_listener_and_channel() {
        let held = crate::socket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = held.local_addr().unwrap();

        let launcher = ExecLauncher::new(std::env::current_exe().unwrap()).with_args([
            "--exact",
            "master::launcher::tests::reexecuted_worker_side",
            "--test-threads=1",
        ]);
        let worker = launcher
            .launch(&LaunchRequest {
                reason: ForkReason::Reload,
                master_pid: std::process::id(),
            })
            .unwrap();

        let (mut reader, mut writer) = worker.channel.split();
        crate::bridge::channel::send(&mut writer, ControlMessage::quit().with_value(addr.to_string()))
            .await
            .unwrap();

        // The child bound the address this process is still listening on.
        let reply = tokio::time::timeout(Duration::from_secs(30), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageType::Takeover);
        assert_eq!(&reply.value[..], addr.to_string().as_bytes());

        let exit = tokio::time::timeout(Duration::from_secs(30), worker.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Success);
        assert_eq!(held.local_addr().unwrap(), addr);
    }
}
