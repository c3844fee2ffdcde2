//! Framed callback messages carrying change events to a client.
//!
//! A provider notifies a subscribed client by sending one frame to the
//! observer stub it was handed at subscribe time:
//!
//! ```text
//! [interface (4 bytes BE)][length (4 bytes BE)][rkyv payload]
//! ```
//!
//! The interface tells the stub which kind of change the payload holds, so a
//! stub can reject frames meant for another subscription class before paying
//! for deserialization.

use rkyv::{Archive, Deserialize, Serialize};

use crate::change::{ProxyDataChangeInfo, PublishedDataChangeNode, RdbChangeNode};
use crate::Error;

/// Maximum callback payload size (4 MB).
pub const MAX_CALLBACK_SIZE: usize = 4 * 1024 * 1024;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Callback interfaces a client serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackInterface {
    /// Rdb template changes.
    Rdb,
    /// Published data changes.
    PublishedData,
    /// Shared-config changes.
    ProxyData,
}

impl CallbackInterface {
    /// Wire code of this interface.
    pub fn code(self) -> u32 {
        match self {
            CallbackInterface::Rdb => 1,
            CallbackInterface::PublishedData => 2,
            CallbackInterface::ProxyData => 3,
        }
    }

    /// Resolve a wire code.
    pub fn from_code(code: u32) -> Result<Self, Error> {
        match code {
            1 => Ok(CallbackInterface::Rdb),
            2 => Ok(CallbackInterface::PublishedData),
            3 => Ok(CallbackInterface::ProxyData),
            other => Err(Error::UnknownInterface(other)),
        }
    }
}

/// A change event as delivered over the callback channel.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum CallbackMessage {
    /// One rdb template change.
    Rdb(RdbChangeNode),
    /// A batch of published data changes.
    PublishedData(PublishedDataChangeNode),
    /// A batch of shared-config changes.
    ProxyData(Vec<ProxyDataChangeInfo>),
}

impl CallbackMessage {
    /// Interface this message is addressed to.
    pub fn interface(&self) -> CallbackInterface {
        match self {
            CallbackMessage::Rdb(_) => CallbackInterface::Rdb,
            CallbackMessage::PublishedData(_) => CallbackInterface::PublishedData,
            CallbackMessage::ProxyData(_) => CallbackInterface::ProxyData,
        }
    }
}

/// Serialize and frame a callback message.
pub fn encode(message: &CallbackMessage) -> Result<Vec<u8>, Error> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("failed to serialize callback: {}", e)))?;

    if payload.len() > MAX_CALLBACK_SIZE {
        return Err(Error::InvalidMessage(format!(
            "callback size {} exceeds maximum {}",
            payload.len(),
            MAX_CALLBACK_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&message.interface().code().to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read the interface from a frame header without decoding the payload.
pub fn peek_interface(frame: &[u8]) -> Result<CallbackInterface, Error> {
    let (interface, _) = read_header(frame)?;
    Ok(interface)
}

/// Decode a framed callback message.
pub fn decode(frame: &[u8]) -> Result<CallbackMessage, Error> {
    let (interface, len) = read_header(frame)?;

    let body = &frame[HEADER_SIZE..];
    if body.len() < len {
        return Err(Error::InvalidMessage(format!(
            "frame incomplete: have {}, need {}",
            body.len(),
            len
        )));
    }

    // rkyv needs an aligned buffer to validate the archive
    let mut aligned: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::new();
    aligned.extend_from_slice(&body[..len]);

    let message = rkyv::from_bytes::<CallbackMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Deserialization(format!("failed to deserialize callback: {}", e)))?;

    if message.interface() != interface {
        return Err(Error::InvalidMessage(format!(
            "frame header says {:?} but payload is {:?}",
            interface,
            message.interface()
        )));
    }

    Ok(message)
}

fn read_header(frame: &[u8]) -> Result<(CallbackInterface, usize), Error> {
    if frame.len() < HEADER_SIZE {
        return Err(Error::InvalidMessage(format!(
            "buffer too short for callback header: {} < {}",
            frame.len(),
            HEADER_SIZE
        )));
    }

    let mut code = [0u8; 4];
    code.copy_from_slice(&frame[..4]);
    let interface = CallbackInterface::from_code(u32::from_be_bytes(code))?;

    let mut len = [0u8; 4];
    len.copy_from_slice(&frame[4..HEADER_SIZE]);
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_CALLBACK_SIZE {
        return Err(Error::InvalidMessage(format!(
            "callback length {} exceeds maximum {}",
            len, MAX_CALLBACK_SIZE
        )));
    }

    Ok((interface, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeType, ProxyValue, PublishedDataItem};
    use crate::template::TemplateId;

    #[test]
    fn test_rdb_callback_roundtrip() {
        let message = CallbackMessage::Rdb(RdbChangeNode::new(
            "datashareproxy://com.example/table",
            TemplateId::new(7, "com.example"),
            vec!["{\"id\":1}".to_string()],
        ));

        let frame = encode(&message).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 1]);
        assert_eq!(peek_interface(&frame).unwrap(), CallbackInterface::Rdb);
        assert_eq!(decode(&frame).unwrap(), message);
    }

    #[test]
    fn test_published_and_proxy_interfaces() {
        let published = CallbackMessage::PublishedData(PublishedDataChangeNode::new(
            "com.example",
            vec![PublishedDataItem::new("key", 1, "value")],
        ));
        let proxy = CallbackMessage::ProxyData(vec![ProxyDataChangeInfo::new(
            ChangeType::Update,
            "datashareproxy://com.example/config",
            ProxyValue::Bool(true),
        )]);

        let frame = encode(&published).unwrap();
        assert_eq!(peek_interface(&frame).unwrap(), CallbackInterface::PublishedData);

        let frame = encode(&proxy).unwrap();
        assert_eq!(decode(&frame).unwrap(), proxy);
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(matches!(decode(&[0, 0, 0]), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_decode_rejects_unknown_interface() {
        let frame = [0, 0, 0, 9, 0, 0, 0, 0];
        assert!(matches!(decode(&frame), Err(Error::UnknownInterface(9))));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let message = CallbackMessage::ProxyData(vec![]);
        let frame = encode(&message).unwrap();
        let truncated = &frame[..frame.len() - 1];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn test_decode_rejects_mismatched_header() {
        let message = CallbackMessage::ProxyData(vec![]);
        let mut frame = encode(&message).unwrap();
        frame[3] = 1;
        assert!(matches!(decode(&frame), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut frame = vec![0, 0, 0, 1];
        frame.extend_from_slice(&((MAX_CALLBACK_SIZE as u32) + 1).to_be_bytes());
        assert!(decode(&frame).is_err());
    }
}
