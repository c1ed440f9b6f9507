//! Parse/serialize seam for application messages
//!
//! The link layer never looks inside a payload. Anything that can turn
//! itself into bytes and back can ride a connection: every prost message
//! does so automatically, and [`RawFrame`] passes bytes through untouched.

use bytes::Bytes;

use crate::error::Result;

/// A message that can be carried in one frame
pub trait RadioMessage: Sized + Send + 'static {
    /// Serialize into payload bytes
    fn encode_payload(&self) -> Vec<u8>;

    /// Parse one payload
    fn decode_payload(payload: &[u8]) -> Result<Self>;
}

impl<T> RadioMessage for T
where
    T: prost::Message + Default + Send + 'static,
{
    fn encode_payload(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        Ok(T::decode(payload)?)
    }
}

/// Undecoded payload bytes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFrame(pub Bytes);

impl RawFrame {
    /// Payload length
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(bytes: Vec<u8>) -> Self {
        RawFrame(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for RawFrame {
    fn from(bytes: &'static [u8]) -> Self {
        RawFrame(Bytes::from_static(bytes))
    }
}

impl RadioMessage for RawFrame {
    fn encode_payload(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        Ok(RawFrame(Bytes::copy_from_slice(payload)))
    }
}
