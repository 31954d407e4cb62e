//! Structure restore at the archival destination.

mod restorer;
mod types;

pub use restorer::{FileLinker, FsLinker, StructureRestorer};
pub use types::*;
