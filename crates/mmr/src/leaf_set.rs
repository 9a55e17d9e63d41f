use std::path::PathBuf;

use roaring::RoaringBitmap;

use crate::error::MmrError;

/// Bitmap over output MMR leaf positions; a set bit means unspent.
#[derive(Clone)]
pub struct LeafSet {
    path: Option<PathBuf>,
    bitmap: RoaringBitmap,
}

impl LeafSet {
    pub fn empty() -> Self {
        Self {
            path: None,
            bitmap: RoaringBitmap::new(),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MmrError> {
        let path = path.into();
        let bitmap = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => RoaringBitmap::new(),
            Ok(bytes) => RoaringBitmap::deserialize_from(&bytes[..])
                .map_err(|_| MmrError::Corrupt("leaf set bitmap does not parse"))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RoaringBitmap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: Some(path),
            bitmap,
        })
    }

    pub fn add(&mut self, pos: u64) {
        self.bitmap.insert(pos as u32);
    }

    pub fn remove(&mut self, pos: u64) {
        self.bitmap.remove(pos as u32);
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos <= u32::MAX as u64 && self.bitmap.contains(pos as u32)
    }

    pub fn len(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.bitmap.iter().map(|pos| pos as u64)
    }

    /// Serialized form, stored per header so rewind can restore the exact
    /// unspent set at that height.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.bitmap.serialized_size());
        self.bitmap
            .serialize_into(&mut bytes)
            .expect("roaring serialize into vec");
        bytes
    }

    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), MmrError> {
        self.bitmap = if bytes.is_empty() {
            RoaringBitmap::new()
        } else {
            RoaringBitmap::deserialize_from(bytes)
                .map_err(|_| MmrError::Corrupt("leaf set snapshot does not parse"))?
        };
        Ok(())
    }

    pub fn flush(&self) -> Result<(), MmrError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}
