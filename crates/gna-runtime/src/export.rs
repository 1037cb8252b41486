//! Model export
//!
//! Compiles descriptors for a generation that need not be present and
//! lays them out with the model's memory exactly as the device would see
//! it, for loading on embedded targets.
//!
//! ```text
//! "GNAX"  version:u32  layers:u32  regions:u32  descriptor_len:u64  image_len:u64
//! regions × { offset:u64  size:u64 }
//! image (descriptor area first, every region page-aligned)
//! ```
//!
//! All integers are little-endian.

use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};
use gna_chip::DeviceVersion;

use crate::error::{GnaError, Result};
use crate::hardware_model::{HardwareModel, HardwareTarget};
use crate::model::CompiledModel;
use crate::partition::{CapabilityTable, SubModelKind};

/// Magic bytes opening an exported model.
pub const EXPORT_MAGIC: [u8; 4] = *b"GNAX";

const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 8 + 8;

/// Placement of one allocation in the exported image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportedRegion {
    /// Page-aligned offset in the image
    pub offset: u64,
    /// Bytes used by the allocation
    pub size: u64,
}

/// Descriptors and memory of a model compiled for one generation.
#[derive(Debug, Clone)]
pub struct ExportedModel {
    version: DeviceVersion,
    layer_count: usize,
    descriptor_len: usize,
    regions: Vec<ExportedRegion>,
    image: Bytes,
}

impl ExportedModel {
    /// Compile `model` for `target` and capture its memory.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::UnsupportedOperation` if no layer runs on the
    /// target and descriptor errors tagged with the layer index.
    pub fn build(model: &CompiledModel, target: HardwareTarget) -> Result<Self> {
        let runs = model.partition(&CapabilityTable::hardware(target.version));
        if runs.iter().all(|r| r.kind == SubModelKind::Software) {
            return Err(GnaError::unsupported(format!(
                "no layer of {} runs on {}",
                model.id(),
                target.version
            )));
        }
        let hardware = HardwareModel::build(model.layers(), model.memory(), &runs, target)?;
        let container = hardware.container();
        let total = usize::try_from(container.total_size(true))
            .map_err(|_| GnaError::out_of_bounds("image exceeds address space"))?;
        let mut image = vec![0u8; total];
        container.copy_data(&mut image)?;

        let regions = container
            .regions()
            .iter()
            .map(|r| ExportedRegion {
                offset: r.aligned_offset(),
                size: r.memory().size() as u64,
            })
            .collect();
        tracing::info!(
            "Exported {} for {}: {} descriptor bytes, {} byte image",
            model.id(),
            target.version,
            hardware.descriptors().bytes().len(),
            total
        );
        Ok(Self {
            version: target.version,
            layer_count: model.layer_count(),
            descriptor_len: hardware.descriptors().bytes().len(),
            regions,
            image: Bytes::from(image),
        })
    }

    /// Generation the descriptors target.
    #[must_use]
    pub const fn version(&self) -> DeviceVersion {
        self.version
    }

    /// Number of layers, including software-only ones.
    #[must_use]
    pub const fn layer_count(&self) -> usize {
        self.layer_count
    }

    /// Descriptor area.
    #[must_use]
    pub fn descriptors(&self) -> &[u8] {
        &self.image[..self.descriptor_len]
    }

    /// Full memory image.
    #[must_use]
    pub fn image(&self) -> &Bytes {
        &self.image
    }

    /// Allocation placement, descriptor area first.
    #[must_use]
    pub fn regions(&self) -> &[ExportedRegion] {
        &self.regions
    }

    /// Serialized header and region table.
    #[allow(clippy::cast_possible_truncation)]
    fn header(&self) -> Bytes {
        let mut header = BytesMut::with_capacity(HEADER_LEN + self.regions.len() * 16);
        header.put_slice(&EXPORT_MAGIC);
        header.put_u32_le(self.version.raw());
        header.put_u32_le(self.layer_count as u32);
        header.put_u32_le(self.regions.len() as u32);
        header.put_u64_le(self.descriptor_len as u64);
        header.put_u64_le(self.image.len() as u64);
        for region in &self.regions {
            header.put_u64_le(region.offset);
            header.put_u64_le(region.size);
        }
        header.freeze()
    }

    /// Write the export to `out`. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn write_to(&self, mut out: impl Write) -> Result<usize> {
        let header = self.header();
        out.write_all(&header)?;
        out.write_all(&self.image)?;
        out.flush()?;
        Ok(header.len() + self.image.len())
    }
}

/// Header fields of an exported model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportHeader {
    /// Generation
    pub version: DeviceVersion,
    /// Number of layers
    pub layer_count: u32,
    /// Number of regions in the table
    pub region_count: u32,
    /// Bytes of the descriptor area
    pub descriptor_len: u64,
    /// Bytes of the image
    pub image_len: u64,
}

/// Read the fixed header of an exported model.
///
/// # Errors
///
/// Returns `GnaError::InvalidModel` for short input, wrong magic bytes or
/// an unknown generation.
pub fn parse_header(data: &[u8]) -> Result<ExportHeader> {
    if data.len() < HEADER_LEN {
        return Err(GnaError::invalid_model("export header truncated"));
    }
    if data[0..4] != EXPORT_MAGIC {
        tracing::error!("Invalid export magic: {:02x?}", &data[0..4]);
        return Err(GnaError::invalid_model("not an exported model"));
    }
    let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    let u64_at = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[at..at + 8]);
        u64::from_le_bytes(raw)
    };
    let version = DeviceVersion::from_raw(u32_at(4))
        .ok_or_else(|| GnaError::invalid_model(format!("unknown generation {:#x}", u32_at(4))))?;
    Ok(ExportHeader {
        version,
        layer_count: u32_at(8),
        region_count: u32_at(12),
        descriptor_len: u64_at(16),
        image_len: u64_at(24),
    })
}

#[cfg(test)]
mod tests {
    use gna_chip::{DataWidth, XnnField};

    use super::*;
    use crate::cpu::SoftwareModes;
    use crate::kernels::KernelTable;
    use crate::memory::MemoryArena;
    use crate::model::{ModelDescription, ModelId, Operation, Tensor};

    fn model(arena: &mut MemoryArena, input: DataWidth) -> CompiledModel {
        let base = arena.allocate(4096).unwrap().address();
        let op = Operation::affine(
            Tensor::new(&[1, 16], input).at(base + 1024),
            Tensor::new(&[1, 4], DataWidth::Int32).at(base + 2048),
            Tensor::new(&[4, 16], DataWidth::Int16).at(base),
            Tensor::new(&[4], DataWidth::Int32).at(base + 256),
        );
        CompiledModel::compile(
            ModelId(2),
            &ModelDescription::new(vec![op]),
            arena,
            &KernelTable::new(SoftwareModes::generic_only()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn export_places_descriptors_first() {
        let mut arena = MemoryArena::new();
        let model = model(&mut arena, DataWidth::Int16);
        let export =
            ExportedModel::build(&model, HardwareTarget::for_version(DeviceVersion::Gna2_0)).unwrap();
        assert_eq!(export.regions().len(), 2);
        assert_eq!(export.regions()[0].offset, 0);
        assert_eq!(export.regions()[1].offset, 4096);

        let layout = gna_chip::DescriptorLayout::for_version(DeviceVersion::Gna2_0);
        let weights = layout.xnn(XnnField::WeightBuffer).unwrap();
        assert_eq!(weights.read(export.descriptors()), Some(4096));
        let input = layout.xnn(XnnField::InputBuffer).unwrap();
        assert_eq!(input.read(export.descriptors()), Some(4096 + 1024));
    }

    #[test]
    fn header_describes_the_image() {
        let mut arena = MemoryArena::new();
        let model = model(&mut arena, DataWidth::Int16);
        let export =
            ExportedModel::build(&model, HardwareTarget::for_version(DeviceVersion::Gna3_0)).unwrap();
        let mut out = Vec::new();
        let written = export.write_to(&mut out).unwrap();
        assert_eq!(written, out.len());

        let header = parse_header(&out).unwrap();
        assert_eq!(header.version, DeviceVersion::Gna3_0);
        assert_eq!(header.layer_count, 1);
        assert_eq!(header.region_count, 2);
        assert_eq!(header.image_len, export.image().len() as u64);
        assert_eq!(&out[out.len() - export.image().len()..], &export.image()[..]);
    }

    #[test]
    fn software_only_models_cannot_be_exported() {
        let mut arena = MemoryArena::new();
        // 8-bit inputs with 16-bit weights have no GNA 1.0 descriptor
        let model = model(&mut arena, DataWidth::Int8);
        let err = ExportedModel::build(&model, HardwareTarget::for_version(DeviceVersion::Gna1_0))
            .unwrap_err();
        assert!(matches!(err, GnaError::UnsupportedOperation { .. }));
    }

    #[test]
    fn foreign_files_are_rejected() {
        assert!(parse_header(b"GNAX").is_err());
        let mut data = vec![0u8; HEADER_LEN];
        data[..4].copy_from_slice(b"FBZ0");
        assert!(matches!(
            parse_header(&data),
            Err(GnaError::InvalidModel { .. })
        ));
    }
}
