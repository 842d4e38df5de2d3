//! Importer subprocess management
//!
//! Decoding happens out of process: an external importer program is run
//! with the source path as its only argument and writes raw interleaved
//! stereo 16-bit PCM at the system rate to its standard output. This
//! module owns the child and the read end of that pipe, keeps the read end
//! non-blocking so the ingest pump can be driven from a poll loop, and
//! reaps the child when the import ends.
//!
//! `stop` and `abort` consume the handle, so the reap happens exactly once
//! per spawned child by construction.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

use super::error::{TrackError, TrackResult};

/// A running importer child and the read end of its stdout pipe.
#[derive(Debug)]
pub(super) struct Importer {
    child: Child,
    stdout: ChildStdout,
}

impl Importer {
    /// Launch `importer` to decode `source`.
    ///
    /// stdout is piped back to us and switched to non-blocking; stderr
    /// passes through to the host's stderr. On failure nothing is left
    /// running.
    pub(super) fn start(importer: &Path, source: &Path) -> TrackResult<Self> {
        let mut child = Command::new(importer)
            .arg0("import")
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| spawn_err(importer, err))?;

        let stdout = child.stdout.take().expect("stdout was requested piped");

        if let Err(err) = set_nonblocking(stdout.as_raw_fd()) {
            // Leave no half-started import behind.
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_err(importer, err));
        }

        log::info!("importing {:?} via {:?}", source, importer);
        Ok(Self { child, stdout })
    }

    /// Descriptor for the host poll loop.
    pub(super) fn fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    /// Non-blocking read from the pipe. `WouldBlock` means no data yet;
    /// `Ok(0)` means the importer closed its end.
    pub(super) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }

    /// Conclude the import: close the pipe and wait for the child. To be
    /// called whether the importer was aborted or completed.
    pub(super) fn stop(self) -> Option<ExitStatus> {
        let Self { mut child, stdout } = self;

        // Closing the read end first means a child that is still producing
        // dies on its next write rather than blocking forever.
        drop(stdout);

        match child.wait() {
            Ok(status) if status.success() => {
                log::info!("track import completed");
                Some(status)
            }
            Ok(status) => {
                log::warn!("track import did not complete successfully ({status})");
                Some(status)
            }
            Err(err) => {
                log::error!("failed to reap importer: {err}");
                None
            }
        }
    }

    /// Prematurely terminate the import, then reap the child.
    pub(super) fn abort(self) -> Option<ExitStatus> {
        let pid = self.child.id() as libc::pid_t;
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            log::error!(
                "failed to signal importer: {}",
                io::Error::last_os_error()
            );
        }
        self.stop()
    }
}

fn spawn_err(importer: &Path, source: io::Error) -> TrackError {
    TrackError::SpawnFailed {
        importer: importer.to_path_buf(),
        source,
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl calls on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
