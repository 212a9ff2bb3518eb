//! Worker process spawning
//!
//! The controller binds the listening socket itself and hands it to the
//! worker by fd number (`serve --listen-fd N`). Only that fd has its
//! close-on-exec flag cleared, and only in the child.

use std::ffi::OsString;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::DaemonConfig;

/// Build the argument list for `<program> serve ...`
pub(crate) fn worker_args(config: &DaemonConfig, listen_fd: RawFd) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "serve".into(),
        "--listen-fd".into(),
        listen_fd.to_string().into(),
        "--mode".into(),
        config.mode.as_str().into(),
    ];
    if let Some(root) = &config.root {
        args.push("--root".into());
        args.push(root.as_os_str().to_owned());
    }
    args.extend(config.worker_args.iter().cloned());
    args
}

/// Spawn the worker, passing it `listener`
pub(crate) fn spawn_worker(
    config: &DaemonConfig,
    listener: &TcpListener,
) -> std::io::Result<Child> {
    let fd = listener.as_raw_fd();

    let mut cmd = Command::new(&config.program);
    cmd.args(worker_args(config, fd));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    // Daemonic: never outlive a dropped controller
    cmd.kill_on_drop(true);

    // Runs after fork, before exec: only async-signal-safe calls
    unsafe {
        cmd.pre_exec(move || {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_worker_args() {
        let config = DaemonConfig {
            root: Some(PathBuf::from("/srv/www")),
            worker_args: vec!["--ignore-sigterm".into()],
            ..DaemonConfig::new("/usr/bin/sighttpd")
        };

        let args = worker_args(&config, 7);
        let args: Vec<&str> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "serve",
                "--listen-fd",
                "7",
                "--mode",
                config.mode.as_str(),
                "--root",
                "/srv/www",
                "--ignore-sigterm"
            ]
        );
    }
}
