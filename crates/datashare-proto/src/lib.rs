//! DataShare protocol types and serialization.
//!
//! This crate defines the types a DataShare client exchanges with
//! data-sharing providers: query template ids, per-key operation results and
//! the change payloads delivered on the callback channel.
//!
//! # Modules
//!
//! - [`template`] - Template ids and operation results
//! - [`change`] - Rdb, published-data and shared-config change payloads
//! - [`callback`] - Framed callback messages
//! - [`error`] - Protocol error types
//!
//! # Serialization
//!
//! Payload types derive `rkyv::Archive`, `rkyv::Serialize` and
//! `rkyv::Deserialize`; callback frames are produced and consumed through
//! [`callback::encode`] and [`callback::decode`]:
//!
//! ```ignore
//! use datashare_proto::{callback, CallbackMessage, RdbChangeNode, TemplateId};
//!
//! let message = CallbackMessage::Rdb(RdbChangeNode::new(
//!     "datashareproxy://com.example/table",
//!     TemplateId::new(1, "com.example"),
//!     vec![],
//! ));
//! let frame = callback::encode(&message).unwrap();
//! assert_eq!(callback::decode(&frame).unwrap(), message);
//! ```

pub mod callback;
pub mod change;
pub mod error;
pub mod template;

pub use error::Error;

// Re-export commonly used types at crate root
pub use callback::{CallbackInterface, CallbackMessage};
pub use change::{
    ChangeType, ProxyDataChangeInfo, ProxyValue, PublishedDataChangeNode, PublishedDataItem,
    PublishedValue, RdbChangeNode, URI_MAX_COUNT, URI_MAX_SIZE, VALUE_MAX_SIZE,
};
pub use template::{all_succeeded, OperationResult, ResultCode, TemplateId};
