//! Descriptor area of one model
//!
//! Owns the bytes of every xNN slot and legacy GMM record and exposes them
//! only through typed, bounds-checked field accessors.

use gna_chip::{DescriptorLayout, FieldError, FieldLocation, GmmField, XnnField};

use crate::error::{GnaError, Result};

/// Descriptor bytes laid out for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorArena {
    layout: DescriptorLayout,
    layer_count: usize,
    gmm_count: usize,
    bytes: Vec<u8>,
}

impl DescriptorArena {
    /// Zeroed area for `layer_count` slots and `gmm_count` GMM layers.
    #[must_use]
    pub fn new(layout: DescriptorLayout, layer_count: usize, gmm_count: usize) -> Self {
        Self {
            layout,
            layer_count,
            gmm_count,
            bytes: vec![0; layout.area_size(layer_count, gmm_count)],
        }
    }

    /// Layout in use.
    #[must_use]
    pub const fn layout(&self) -> &DescriptorLayout {
        &self.layout
    }

    /// Raw bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte offset of a layer's xNN slot.
    #[must_use]
    pub const fn xnn_offset(&self, layer: usize) -> usize {
        layer * self.layout.xnn_size
    }

    /// Byte offset of the `ordinal`-th legacy GMM record.
    #[must_use]
    pub const fn gmm_config_offset(&self, ordinal: usize) -> usize {
        self.layer_count * self.layout.xnn_size + ordinal * self.layout.gmm_config_size
    }

    /// Number of legacy GMM records.
    #[must_use]
    pub const fn gmm_count(&self) -> usize {
        self.gmm_count
    }

    /// Absolute location of an xNN field of a layer.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::UnsupportedOperation` if the generation lacks the
    /// field.
    pub fn xnn_location(&self, layer: usize, field: XnnField) -> Result<FieldLocation> {
        self.layout
            .xnn(field)
            .map(|loc| loc.rebased(self.xnn_offset(layer)))
            .ok_or_else(|| {
                GnaError::unsupported(format!("{field:?} not present on {}", self.layout.version))
            })
    }

    /// Absolute location of a GMM field of the block at `block`.
    #[must_use]
    pub const fn gmm_location(&self, block: usize, field: GmmField) -> FieldLocation {
        self.layout.gmm(field).rebased(block)
    }

    /// Write an xNN field of a layer.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidModel` if the value does not fit the field.
    pub fn write_xnn(&mut self, layer: usize, field: XnnField, value: u32) -> Result<()> {
        let loc = self.xnn_location(layer, field)?;
        loc.write(&mut self.bytes, value)
            .map_err(|e| field_error(&format!("{field:?}"), &e))
    }

    /// Read an xNN field of a layer.
    #[must_use]
    pub fn read_xnn(&self, layer: usize, field: XnnField) -> Option<u32> {
        self.xnn_location(layer, field).ok()?.read(&self.bytes)
    }

    /// Write a GMM field of the block at `block`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidModel` if the value does not fit the field.
    pub fn write_gmm(&mut self, block: usize, field: GmmField, value: u32) -> Result<()> {
        self.gmm_location(block, field)
            .write(&mut self.bytes, value)
            .map_err(|e| field_error(&format!("{field:?}"), &e))
    }

    /// Read a GMM field of the block at `block`.
    #[must_use]
    pub fn read_gmm(&self, block: usize, field: GmmField) -> Option<u32> {
        self.gmm_location(block, field).read(&self.bytes)
    }
}

fn field_error(field: &str, error: &FieldError) -> GnaError {
    match error {
        FieldError::Overflow { .. } => GnaError::invalid_model(format!("{field}: {error}")),
        FieldError::OutOfBounds { .. } => GnaError::out_of_bounds(format!("{field}: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use gna_chip::DeviceVersion;

    use super::*;

    #[test]
    fn legacy_gmm_records_follow_the_slots() {
        let arena = DescriptorArena::new(DescriptorLayout::for_version(DeviceVersion::Gna1_0), 3, 2);
        assert_eq!(arena.bytes().len(), 5 * 128);
        assert_eq!(arena.xnn_offset(2), 256);
        assert_eq!(arena.gmm_config_offset(1), 3 * 128 + 128);
    }

    #[test]
    fn fields_are_bounds_checked() {
        let mut arena =
            DescriptorArena::new(DescriptorLayout::for_version(DeviceVersion::Gna2_0), 2, 0);
        arena.write_xnn(1, XnnField::InputElementCount, 640).unwrap();
        assert_eq!(arena.read_xnn(1, XnnField::InputElementCount), Some(640));
        assert_eq!(arena.read_xnn(0, XnnField::InputElementCount), Some(0));

        let err = arena.write_xnn(1, XnnField::GroupCount, 300).unwrap_err();
        assert!(matches!(err, GnaError::InvalidModel { .. }));
        let err = arena.write_xnn(2, XnnField::OpCode, 1).unwrap_err();
        assert!(matches!(err, GnaError::MemoryOutOfBounds { .. }));
    }

    #[test]
    fn precision_fields_need_3x() {
        let mut arena =
            DescriptorArena::new(DescriptorLayout::for_version(DeviceVersion::Gna2_0), 1, 0);
        assert!(matches!(
            arena.write_xnn(0, XnnField::InputPrecision, 1),
            Err(GnaError::UnsupportedOperation { .. })
        ));
    }
}
