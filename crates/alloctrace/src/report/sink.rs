//! Output sinks for the reporter.
//!
//! The dump streams through this abstraction and never assumes line
//! buffering; a sink that cares about durability implements `flush`.

use std::fs::File;
use std::io::{self, Write};

use crate::error::Result;

pub trait OutputSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn println(&mut self, line: &str) -> io::Result<()> {
        self.write_bytes(line.as_bytes())?;
        self.write_bytes(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct StreamSink<W: Write> {
    inner: W,
}

impl<W: Write> StreamSink<W> {
    pub fn new(inner: W) -> StreamSink<W> {
        StreamSink { inner }
    }
}

impl<W: Write> OutputSink for StreamSink<W> {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// In-memory sink, for tests and embedders that post-process reports.
#[derive(Default)]
pub struct BufferSink {
    pub bytes: Vec<u8>,
}

impl BufferSink {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl OutputSink for BufferSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }
}

/// Expand the `@pid` placeholder in a dump path.
pub fn expand_pid(path: &str) -> String {
    path.replace("@pid", &std::process::id().to_string())
}

/// Open the sink named by a dump-file spec: the literals `stdout` and
/// `stderr`, or a file path that may contain `@pid`.
pub fn open(dump_file: &str) -> Result<Box<dyn OutputSink>> {
    match dump_file {
        "stdout" => Ok(Box::new(StreamSink::new(io::stdout()))),
        "stderr" => Ok(Box::new(StreamSink::new(io::stderr()))),
        path => {
            let file = File::create(expand_pid(path))?;
            Ok(Box::new(StreamSink::new(file)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_placeholder_expands_everywhere() {
        let pid = std::process::id().to_string();
        assert_eq!(expand_pid("/tmp/at.@pid.txt"), format!("/tmp/at.{pid}.txt"));
        assert_eq!(expand_pid("@pid-@pid"), format!("{pid}-{pid}"));
        assert_eq!(expand_pid("/tmp/plain"), "/tmp/plain");
    }

    #[test]
    fn buffer_sink_collects_lines() {
        let mut sink = BufferSink::default();
        sink.println("alpha").unwrap();
        sink.write_bytes(b"beta").unwrap();
        assert_eq!(sink.text(), "alpha\nbeta");
    }
}
