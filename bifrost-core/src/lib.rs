#![doc = "Shared plumbing for the Bifrost bridge: protocol registry, datastore and models, AS1 helpers, the opaque converter seam, task dispatch and the relevant-set loader."]
pub mod as1;
pub mod blocklist;
pub mod convert;
pub mod error;
pub mod ids;
pub mod models;
pub mod protocol;
pub mod report;
pub mod store;
pub mod tasks;
pub mod userset;

pub use error::{CoreError, Result};
pub use protocol::{Protocol, Tri};
