//! The driver contract for the registry's path-addressed object store.
//!
//! Drivers only know about relative paths under their own root. Content
//! addressing, links and tags are layered on top by the registry crate.

mod driver;
mod error;

pub use driver::ByteRange;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
