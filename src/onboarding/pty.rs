//! PTY plumbing for the onboarding driver.
//!
//! The driver either spawns the agent itself in a fresh PTY or attaches to
//! one handed in by the session host. Output bytes always arrive through an
//! mpsc channel fed by a blocking reader thread; keystrokes go out through
//! the [`PtyWriter`] trait so tests can substitute a recording fake.

use std::io::{Read, Write};
use std::thread;

use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::debug;

/// Write side of the agent's terminal.
pub trait PtyWriter: Send {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    fn resize(&mut self, rows: u16, cols: u16) -> std::io::Result<()>;

    /// Tear down the underlying process. Only meaningful for PTYs the
    /// driver owns; attached PTYs implement this as a no-op.
    fn shutdown(&mut self) {}
}

/// A PTY created (and therefore owned) by the driver.
pub struct OwnedPty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl OwnedPty {
    /// Spawn `cmd` in a fresh PTY, returning the write handle and a channel
    /// of output chunks drained by a dedicated reader thread.
    pub fn spawn(
        cmd: CommandBuilder,
        rows: u16,
        cols: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY")?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn agent process")?;
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")?;

        let (tx, rx) = mpsc::channel(64);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("PTY reader thread finished");
        });

        Ok((
            Self {
                master: pair.master,
                writer,
                child,
            },
            rx,
        ))
    }
}

impl PtyWriter for OwnedPty {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    fn resize(&mut self, rows: u16, cols: u16) -> std::io::Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(std::io::Error::other)
    }

    fn shutdown(&mut self) {
        let _ = self.child.kill();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::PtyWriter;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Records every write with a timestamp for assertions on pacing.
    #[derive(Clone, Default)]
    pub struct RecordingWriter {
        pub writes: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
        pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
        pub fail_writes: Arc<Mutex<bool>>,
    }

    impl RecordingWriter {
        pub fn written_bytes(&self) -> Vec<u8> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, b)| b.clone())
                .collect()
        }
    }

    impl PtyWriter for RecordingWriter {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            if *self.fail_writes.lock().unwrap() {
                return Err(std::io::Error::other("write failed"));
            }
            self.writes
                .lock()
                .unwrap()
                .push((Instant::now(), bytes.to_vec()));
            Ok(())
        }

        fn resize(&mut self, rows: u16, cols: u16) -> std::io::Result<()> {
            self.resizes.lock().unwrap().push((rows, cols));
            Ok(())
        }
    }
}
