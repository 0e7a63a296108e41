//! The opaque translator seam. The engine never inspects how AS1 maps to
//! protocol records; it calls through this trait and treats the results as
//! data.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::{Object, User};
use crate::protocol::Protocol;

/// Options for a single conversion.
#[derive(Debug, Clone, Default)]
pub struct ConvertOpts {
    /// User (actor) the activity or object is from; supplies signing keys and
    /// id context.
    pub from_user: Option<User>,
    /// Whether to fetch and re-host referenced media.
    pub fetch_blobs: bool,
}

/// Translates between the AS1 pivot and protocol-native records.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Converts an Object's AS1 form into a record native to `to`. Returns
    /// `None` when the object has no representation there.
    async fn to_record(&self, obj: &Object, to: Protocol, opts: &ConvertOpts)
        -> Result<Option<Value>>;

    /// Converts a protocol-native record back into AS1.
    async fn to_as1(&self, record: &Value, from: Protocol) -> Result<Option<Value>>;
}
