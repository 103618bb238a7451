//! Pseudo-terminal handed to interactive children as their controlling
//! terminal, so prompts written to `/dev/tty` reach the prompt table.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, OutputFlags, SetArg};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::interactive::Stream;

pub(super) struct Terminal {
    master: Arc<AsyncFd<PtyMaster>>,
    /// Held open for the life of the run; the master reports EIO while no
    /// slave descriptor exists.
    slave: File,
}

impl Terminal {
    pub(super) fn open() -> io::Result<Self> {
        let master = posix_openpt(
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
        )?;
        grantpt(&master)?;
        unlockpt(&master)?;
        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NOCTTY.bits())
            .open(ptsname_r(&master)?)?;

        // Answers must not come back as output, and newlines stay as written.
        let mut termios = tcgetattr(&slave)?;
        termios.local_flags.remove(LocalFlags::ECHO);
        termios.output_flags.remove(OutputFlags::ONLCR);
        tcsetattr(&slave, SetArg::TCSANOW, &termios)?;

        Ok(Self {
            master: Arc::new(AsyncFd::new(master)?),
            slave,
        })
    }

    /// Make this terminal the controlling terminal of `command`'s process.
    ///
    /// Must be registered after the hook that starts a new session.
    pub(super) fn attach(&self, command: &mut std::process::Command) {
        let slave = self.slave.as_raw_fd();
        // SAFETY: the hook only issues an ioctl on a descriptor inherited
        // from the parent; the slave is close-on-exec.
        unsafe {
            command.pre_exec(move || {
                if nix::libc::ioctl(slave, nix::libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    /// Forward everything the child writes to the terminal to `tx`.
    pub(super) fn forward(&self, tx: mpsc::Sender<(Stream, Vec<u8>)>) -> JoinHandle<()> {
        let master = self.master.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let Ok(mut guard) = master.readable().await else {
                    break;
                };
                let read = guard.try_io(|inner| {
                    let mut reader = inner.get_ref();
                    reader.read(&mut buf)
                });
                match read {
                    Ok(Ok(0)) | Ok(Err(_)) => break,
                    Ok(Ok(n)) => {
                        if tx.send((Stream::Terminal, buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(_would_block) => continue,
                }
            }
        })
    }

    /// Type `bytes` into the terminal.
    pub(super) async fn write_all(&self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            let mut guard = self.master.writable().await?;
            let written = guard.try_io(|inner| {
                let mut writer = inner.get_ref();
                writer.write(bytes)
            });
            match written {
                Ok(Ok(n)) => bytes = &bytes[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}
