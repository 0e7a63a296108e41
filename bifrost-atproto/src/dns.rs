//! Handle-attestation DNS management. The bridge installs a TXT record at
//! `_atproto.<handle>.` containing `"did=<did>"` so relays can resolve the
//! shadow handle back to its DID.

use async_trait::async_trait;

use crate::error::Result;

pub const DNS_TTL_SECS: u32 = 10800;

/// The DNS management oracle. Existing records for a handle are deleted
/// before re-creating, so re-pointing a handle at a new DID is one call.
#[async_trait]
pub trait DnsAdmin: Send + Sync {
    async fn set_dns(&self, handle: &str, did: &str) -> Result<()>;
    async fn remove_dns(&self, handle: &str) -> Result<()>;
}

/// Logs instead of mutating DNS. Used in development and as the default when
/// no zone credentials are configured.
pub struct LoggingDnsAdmin;

#[async_trait]
impl DnsAdmin for LoggingDnsAdmin {
    async fn set_dns(&self, handle: &str, did: &str) -> Result<()> {
        tracing::info!(name = format!("_atproto.{handle}."), did, ttl = DNS_TTL_SECS,
            "would add DNS TXT record");
        Ok(())
    }

    async fn remove_dns(&self, handle: &str) -> Result<()> {
        tracing::info!(name = format!("_atproto.{handle}."), "would remove DNS TXT record");
        Ok(())
    }
}
