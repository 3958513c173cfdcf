use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;

/// JSON line writer shared between the analysis and monitor threads.
///
/// Every document is rendered before the lock is taken, so concurrent writers
/// interleave whole lines only.
#[derive(Clone)]
pub struct ConcurrentLineWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ConcurrentLineWriter {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    /// Serialize `document` and write it as one line.
    pub fn write<T: Serialize + ?Sized>(&self, document: &T) -> Result<()> {
        let mut line = serde_json::to_vec(document)?;
        line.push(b'\n');
        let mut sink = self.inner.lock();
        sink.write_all(&line)?;
        sink.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for ConcurrentLineWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentLineWriter").finish_non_exhaustive()
    }
}

/// In-memory sink whose contents stay readable after it is handed to a writer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    /// Parse every non-empty line as JSON, skipping lines that fail to parse.
    pub fn documents(&self) -> Vec<serde_json::Value> {
        self.contents()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_one_document_per_line() {
        let buffer = SharedBuffer::new();
        let writer = ConcurrentLineWriter::new(buffer.clone());
        writer.write(&json!({"a": 1})).unwrap();
        writer.write(&json!({"b": [1, 2]})).unwrap();
        assert_eq!(buffer.contents(), "{\"a\":1}\n{\"b\":[1,2]}\n");
    }

    #[test]
    fn concurrent_writes_are_not_torn() {
        let buffer = SharedBuffer::new();
        let writer = ConcurrentLineWriter::new(buffer.clone());
        std::thread::scope(|scope| {
            for t in 0..4 {
                let writer = writer.clone();
                scope.spawn(move || {
                    for i in 0..100 {
                        writer.write(&json!({"thread": t, "i": i, "pad": "x".repeat(64)})).unwrap();
                    }
                });
            }
        });
        let docs = buffer.documents();
        assert_eq!(docs.len(), 400);
        assert_eq!(buffer.contents().lines().count(), 400);
    }
}
