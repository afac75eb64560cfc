use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::LevelFilter;

/// Log file used when `DEBUG` is set without `--log-file`.
pub const DEFAULT_LOG_FILE: &str = "agentdeck.log";

/// Append-only log file shared by the logger backend.
///
/// The session owns the terminal, so records never go to stdout or stderr.
/// After [`close`](Self::close) the file is released and later records are
/// dropped.
#[derive(Clone)]
pub struct LogSink {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Route the `log` facade into this sink. `RUST_LOG` overrides `level`.
    pub fn install(&self, level: LevelFilter) -> Result<(), log::SetLoggerError> {
        env_logger::Builder::new()
            .filter_level(level)
            .parse_env("RUST_LOG")
            .format_timestamp_millis()
            .write_style(env_logger::WriteStyle::Never)
            .target(env_logger::Target::Pipe(Box::new(self.writer())))
            .try_init()
    }

    pub fn writer(&self) -> LogWriter {
        LogWriter {
            file: Arc::clone(&self.file),
        }
    }

    /// Flush and release the file.
    pub fn close(&self) {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut file) = file {
            let _ = file.flush();
        }
    }
}

/// `Write` handle onto a [`LogSink`].
pub struct LogWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        match file.as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        match file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

/// Where to log, if anywhere: an explicit path wins, otherwise
/// `DEBUG=1|true` selects [`DEFAULT_LOG_FILE`].
pub fn log_path(explicit: Option<PathBuf>, debug_env: Option<&str>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    match debug_env.map(str::trim) {
        Some(v) if v == "1" || v.eq_ignore_ascii_case("true") => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_selection() {
        let explicit = Some(PathBuf::from("/tmp/x.log"));
        assert_eq!(log_path(explicit.clone(), Some("1")), explicit);
        assert_eq!(log_path(None, Some("1")), Some(PathBuf::from(DEFAULT_LOG_FILE)));
        assert_eq!(log_path(None, Some("TRUE")), Some(PathBuf::from(DEFAULT_LOG_FILE)));
        assert_eq!(log_path(None, Some("0")), None);
        assert_eq!(log_path(None, None), None);
    }

    #[test]
    fn test_writer_appends_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let sink = LogSink::open(&path).unwrap();

        let mut writer = sink.writer();
        writer.write_all(b"first\n").unwrap();
        writer.flush().unwrap();
        sink.close();
        writer.write_all(b"dropped\n").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\n");
        assert_eq!(sink.path(), path.as_path());
    }

    #[test]
    fn test_open_appends_to_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "old\n").unwrap();

        let sink = LogSink::open(&path).unwrap();
        sink.writer().write_all(b"new\n").unwrap();
        sink.close();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
