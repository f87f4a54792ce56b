//! Serializes events to a rotated log file via a codec.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use tracing::{debug, info};

use crate::reactor::event::{Event, EventPtr};
use crate::reactor::{Emitter, Reactor, ReactorKind};
use crate::{Error, Result};

/// Encodes events onto an output sink.
pub trait Codec: Send {
    /// Writes one event.
    fn write(&mut self, sink: &mut dyn io::Write, event: &Event) -> Result<()>;

    /// Finalizes the sink before it is closed.
    fn finish(&mut self, sink: &mut dyn io::Write) -> Result<()> {
        let _ = sink;
        Ok(())
    }
}

/// Line-delimited JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn write(&mut self, sink: &mut dyn io::Write, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| Error::new_io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        sink.write_all(line.as_bytes()).map_err(Error::new_io)?;
        sink.write_all(b"\n").map_err(Error::new_io)
    }
}

struct LogFile {
    codec: Box<dyn Codec>,
    path: PathBuf,
    file: Option<File>,
    running: bool,
}

/// A storage reactor appending every delivered event to a log file
/// and forwarding it downstream.
///
/// [`rotate`](LogOutputHandle::rotate) renames the current file with a
/// `-YYYYMMDD-HHMMSS` suffix inserted before the extension and starts
/// a fresh one; a file that received no events is removed instead.
pub struct LogOutputReactor {
    inner: Arc<Mutex<LogFile>>,
}

/// Clonable handle for rotating a [`LogOutputReactor`] after it has
/// been moved into an engine.
#[derive(Clone)]
pub struct LogOutputHandle {
    inner: Arc<Mutex<LogFile>>,
}

impl fmt::Debug for LogOutputReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("LogOutputReactor")
            .field("path", &inner.path)
            .field("open", &inner.file.is_some())
            .finish()
    }
}

impl fmt::Debug for LogOutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOutputHandle").finish()
    }
}

impl LogOutputReactor {
    /// Creates a reactor writing to `path` with the given codec.
    pub fn new(codec: Box<dyn Codec>, path: impl Into<PathBuf>) -> LogOutputReactor {
        LogOutputReactor {
            inner: Arc::new(Mutex::new(LogFile {
                codec,
                path: path.into(),
                file: None,
                running: false,
            })),
        }
    }

    /// Returns a handle usable after the reactor moves into an engine.
    pub fn handle(&self) -> LogOutputHandle {
        LogOutputHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl LogOutputHandle {
    /// Rotates the log file. Fails if a file with the rotation
    /// timestamp already exists.
    pub fn rotate(&self) -> Result<()> {
        lock(&self.inner).rotate()
    }

    /// The path events are currently written to.
    pub fn path(&self) -> PathBuf {
        lock(&self.inner).path.clone()
    }
}

impl Reactor for LogOutputReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Storage
    }

    fn start(&mut self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.open()?;
        inner.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.running = false;
        inner.close()
    }

    fn process(&mut self, event: &EventPtr, out: &mut Emitter<'_>) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            inner.write(event)?;
        }
        out.deliver(event.clone());
        Ok(())
    }
}

impl LogFile {
    fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(Error::new_io)?;
        debug!(path = %self.path.display(), "opened output log file");
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, event: &EventPtr) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            Error::new_io(io::Error::new(
                io::ErrorKind::NotConnected,
                "output log file is not open",
            ))
        })?;
        self.codec.write(file, event)
    }

    /// Closes the current file, removing it when nothing was written.
    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            self.codec.finish(&mut file)?;
            drop(file);
            let empty = std::fs::metadata(&self.path)
                .map(|m| m.len() == 0)
                .unwrap_or(false);
            if empty {
                std::fs::remove_file(&self.path).map_err(Error::new_io)?;
                debug!(path = %self.path.display(), "closing empty output log (removing file)");
            } else {
                debug!(path = %self.path.display(), "closing output log file");
            }
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        let timestamp = Local::now().format("-%Y%m%d-%H%M%S").to_string();
        let rotated = timestamped_path(&self.path, &timestamp);
        if rotated.exists() {
            return Err(Error::new_config(format!(
                "log rotation target already exists: {}",
                rotated.display()
            )));
        }

        let was_open = self.file.is_some();
        self.close()?;

        // An empty file was removed by close and needs no rename.
        if self.path.exists() {
            std::fs::rename(&self.path, &rotated).map_err(Error::new_io)?;
            info!(
                from = %self.path.display(),
                to = %rotated.display(),
                "rotated output log file"
            );
        }

        if was_open && self.running {
            self.open()?;
        }
        Ok(())
    }
}

/// Inserts `timestamp` between a path's stem and extension.
fn timestamped_path(path: &Path, timestamp: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{timestamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}{timestamp}"),
    };
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn event(n: u64) -> EventPtr {
        let mut event = Event::new(1);
        event.set_uint(2, n);
        Arc::new(event)
    }

    fn emitter_sink() -> Vec<EventPtr> {
        Vec::new()
    }

    #[test]
    fn writes_json_lines_and_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut reactor = LogOutputReactor::new(Box::new(JsonCodec), &path);
        reactor.start().unwrap();

        let mut emitted = emitter_sink();
        reactor
            .process(&event(1), &mut Emitter { events: &mut emitted })
            .unwrap();
        reactor
            .process(&event(2), &mut Emitter { events: &mut emitted })
            .unwrap();
        reactor.stop().unwrap();

        assert_eq!(emitted.len(), 2);
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["event_type"], 1);
        }
    }

    #[test]
    fn empty_file_is_removed_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.log");
        let mut reactor = LogOutputReactor::new(Box::new(JsonCodec), &path);
        reactor.start().unwrap();
        assert!(path.exists());
        reactor.stop().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rotation_renames_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clicks.log");
        let mut reactor = LogOutputReactor::new(Box::new(JsonCodec), &path);
        let handle = reactor.handle();
        reactor.start().unwrap();

        let mut emitted = emitter_sink();
        reactor
            .process(&event(1), &mut Emitter { events: &mut emitted })
            .unwrap();
        handle.rotate().unwrap();

        // The old contents moved aside; the live file is fresh.
        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != "clicks.log")
            .collect();
        assert_eq!(rotated.len(), 1);
        assert!(rotated[0].starts_with("clicks-"));
        assert!(rotated[0].ends_with(".log"));
        assert!(path.exists());

        reactor
            .process(&event(2), &mut Emitter { events: &mut emitted })
            .unwrap();
        reactor.stop().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn rotating_an_empty_log_just_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiet.log");
        let mut reactor = LogOutputReactor::new(Box::new(JsonCodec), &path);
        let handle = reactor.handle();
        reactor.start().unwrap();
        handle.rotate().unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        // Nothing was written, so nothing was kept except the
        // reopened live file.
        assert_eq!(names, vec!["quiet.log".to_string()]);
    }
}
