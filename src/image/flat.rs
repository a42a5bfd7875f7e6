use super::Image;
use crate::error::{BlocksUnsupported, Result};

/// A raw byte stream; all of it is the target region.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FlatImage {
    data: Vec<u8>,
}

impl Image for FlatImage {
    fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Ok(FlatImage { data: bytes })
    }

    fn target(&self) -> &[u8] {
        &self.data
    }

    fn target_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn block(&self, _name: &str) -> Option<&[u8]> {
        None
    }

    fn store_block(&mut self, name: &str, _contents: &[u8]) -> Result<()> {
        BlocksUnsupported { name }.fail()
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.data.clone()
    }
}
