//! Executable containers as seen by the patch engine: one mutable target
//! region that patterns are matched against, and optional named blocks that
//! can hold metadata.

pub(crate) mod flat;
pub(crate) mod pe;

pub use flat::FlatImage;
pub use pe::PeImage;

use crate::error::Result;

pub trait Image: Sized {
    /// Parses a container. Fails only when the bytes are structurally not
    /// this kind of container.
    fn from_bytes(bytes: Vec<u8>) -> Result<Self>;

    /// Bytes eligible for pattern search and replacement.
    fn target(&self) -> &[u8];

    fn target_mut(&mut self) -> &mut [u8];

    /// Full contents of the named block, if the container has one.
    fn block(&self, name: &str) -> Option<&[u8]>;

    /// Creates the named block or replaces its contents. Must never move or
    /// resize the target region.
    fn store_block(&mut self, name: &str, contents: &[u8]) -> Result<()>;

    fn to_bytes(&self) -> Vec<u8>;
}
