//! Owned frame payloads.

/// The payload of one frame. Owns its bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    /// Wrap existing bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// A zero-filled packet of `len` bytes, ready to be read into.
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    /// Total byte size of the payload.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for Packet {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl From<&str> for Packet {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}
