//! In-memory log sink for tests
//!
//! ```rust
//! use rigger_core::memlog::InMemoryLogger;
//!
//! let logger = InMemoryLogger::new();
//! let subscriber = tracing_subscriber::fmt()
//!     .with_writer(logger.clone())
//!     .with_ansi(false)
//!     .finish();
//! tracing::subscriber::with_default(subscriber, || tracing::info!("hello"));
//! assert!(logger.contains("hello"));
//! ```

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, Default)]
pub struct InMemoryLogger {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl InMemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

pub struct InMemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for InMemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for InMemoryLogger {
    type Writer = InMemoryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        InMemoryWriter {
            buffer: self.buffer.clone(),
        }
    }
}
