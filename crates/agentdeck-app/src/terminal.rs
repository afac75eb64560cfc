use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::Mutex;
use std::time::Duration;

use agentdeck_pty::WindowSize;
use log::debug;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{cfmakeraw, tcflush, tcgetattr, tcsetattr, FlushArg, SetArg, Termios};

/// The local terminal as the passthrough controller uses it.
pub trait HostTerminal: Send + Sync {
    /// Switch to raw mode, remembering the mode to restore.
    fn make_raw(&self) -> io::Result<()>;

    /// Put back the mode saved by the last [`make_raw`](Self::make_raw).
    fn restore(&self);

    fn size(&self) -> Option<WindowSize>;

    /// Read available input, waiting at most `timeout`. `Ok(0)` means no
    /// input arrived; end of input is reported as `UnexpectedEof`.
    fn read_input(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// The process's controlling terminal on stdin/stdout.
pub struct TtyTerminal {
    input: Mutex<File>,
    saved: Mutex<Option<Termios>>,
}

impl TtyTerminal {
    pub fn new() -> io::Result<Self> {
        // A private, unbuffered handle on fd 0 so poll and read agree.
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self {
            input: Mutex::new(File::from(fd)),
            saved: Mutex::new(None),
        })
    }
}

impl HostTerminal for TtyTerminal {
    fn make_raw(&self) -> io::Result<()> {
        let stdin = io::stdin();
        let original = tcgetattr(&stdin)?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;

        let mut saved = self.saved.lock().unwrap_or_else(|e| e.into_inner());
        if saved.is_none() {
            *saved = Some(original);
        }
        Ok(())
    }

    fn restore(&self) {
        let saved = self.saved.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(original) = saved {
            if let Err(e) = tcsetattr(&io::stdin(), SetArg::TCSANOW, &original) {
                debug!("failed to restore terminal mode: {e}");
            }
        }
    }

    fn size(&self) -> Option<WindowSize> {
        crossterm::terminal::size()
            .ok()
            .map(|(cols, rows)| WindowSize::new(rows, cols))
    }

    fn read_input(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut input = self.input.lock().unwrap_or_else(|e| e.into_inner());
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let ready = {
            let mut fds = [PollFd::new(input.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(n) => n,
                Err(Errno::EINTR) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        };
        if ready == 0 {
            return Ok(0);
        }
        match input.read(buf)? {
            0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed")),
            n => Ok(n),
        }
    }
}

/// Throw away keystrokes typed before the session took over the terminal.
pub fn drain_stdin() {
    if let Err(e) = tcflush(io::stdin(), FlushArg::TCIFLUSH) {
        debug!("failed to flush stdin: {e}");
    }
}
