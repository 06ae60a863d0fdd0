use std::fs;
use std::io::{self, Read};
use std::path::Path;

use bytes::{Buf, Bytes};

/// Byte stream a session reads its DATA blocks from.
pub type Payload = Box<dyn Read + Send>;

/// Supplies the payload for a read request.
pub trait FileSource: Send + Sync + 'static {
    fn open(&self, filename: &str) -> io::Result<Payload>;
}

/// Serves the same bytes whatever file the client asks for.
#[derive(Debug, Clone, Default)]
pub struct StaticPayload {
    data: Bytes,
}

impl StaticPayload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        fs::read(path).map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl FileSource for StaticPayload {
    fn open(&self, _filename: &str) -> io::Result<Payload> {
        // Bytes clones share the buffer
        Ok(Box::new(self.data.clone().reader()))
    }
}
