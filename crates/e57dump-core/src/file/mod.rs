//! E57 file handle and data model.
//!
//! This module owns the open path: it validates the 48-byte file
//! header, derives the page geometry, pulls the embedded XML document
//! through the paged reader and hands it to the XML binder. The
//! resulting [`E57File`] carries the decoded point-set descriptors and
//! everything needed to stream records out of the compressed-vector
//! sections.

mod paged;

use crate::bytes::{u32_le, u64_le};
use crate::cvector::packet::PacketReader;
use crate::error::{Error, Result};
use crate::xml;
use tracing::debug;

pub use paged::PageLayout;
pub(crate) use paged::{read as read_paged, read_raw};

/// Magic bytes at the start of every E57 file
const MAGIC: &[u8; 8] = b"ASTM-E57";

/// Size of the fixed file header: magic + 2 u32 + 4 u64
const HEADER_SIZE: usize = 48;

/// Source of file bytes addressable by absolute physical offset.
///
/// Returning a view shorter than `len` signals that the range is
/// unavailable; the paged reader surfaces that as
/// [`Error::ShortRead`](crate::Error::ShortRead). The returned view is
/// only accessed before the next `read` call, so implementations may
/// reuse an internal buffer.
pub trait ByteSource {
    /// Returns a view of `len` contiguous bytes starting at `offset`.
    fn read(&mut self, offset: u64, len: usize) -> &[u8];
}

impl ByteSource for &[u8] {
    fn read(&mut self, offset: u64, len: usize) -> &[u8] {
        let Ok(start) = usize::try_from(offset) else {
            return &[];
        };
        if start > self.len() {
            return &[];
        }
        let end = start.saturating_add(len).min(self.len());
        &self[start..end]
    }
}

impl ByteSource for Vec<u8> {
    fn read(&mut self, offset: u64, len: usize) -> &[u8] {
        let Ok(start) = usize::try_from(offset) else {
            return &[];
        };
        if start > self.len() {
            return &[];
        }
        let end = start.saturating_add(len).min(self.len());
        &self[start..end]
    }
}

/// The fixed file header, parsed from the first 48 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format major version
    pub major: u32,
    /// Format minor version
    pub minor: u32,
    /// Physical length of the file in bytes
    pub file_physical_length: u64,
    /// Physical offset of the embedded XML document
    pub xml_physical_offset: u64,
    /// Logical length of the embedded XML document
    pub xml_logical_length: u64,
    /// Page size in bytes; a power of two
    pub page_size: u64,
}

/// Semantic meaning of a record component, distinct from its numeric type.
///
/// The set of roles is closed; an element name outside this set is not
/// a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Cartesian X coordinate
    CartesianX,
    /// Cartesian Y coordinate
    CartesianY,
    /// Cartesian Z coordinate
    CartesianZ,
    /// Spherical range
    SphericalRange,
    /// Spherical azimuth angle
    SphericalAzimuth,
    /// Spherical elevation angle
    SphericalElevation,
    /// Row index for gridded captures
    RowIndex,
    /// Column index for gridded captures
    ColumnIndex,
    /// Number of returns for this pulse
    ReturnCount,
    /// Index of this return within its pulse
    ReturnIndex,
    /// Acquisition timestamp
    TimeStamp,
    /// Return intensity
    Intensity,
    /// Red color channel
    ColorRed,
    /// Green color channel
    ColorGreen,
    /// Blue color channel
    ColorBlue,
    /// Validity state of the cartesian coordinates
    CartesianInvalidState,
    /// Validity state of the spherical coordinates
    SphericalInvalidState,
    /// Whether the timestamp is invalid
    IsTimeStampInvalid,
    /// Whether the intensity is invalid
    IsIntensityInvalid,
    /// Whether the color is invalid
    IsColorInvalid,
}

impl Role {
    /// Maps an XML element name to its role, if the name is one of the
    /// closed set of component element names.
    pub(crate) fn from_element_name(name: &[u8]) -> Option<Role> {
        Some(match name {
            b"cartesianX" => Role::CartesianX,
            b"cartesianY" => Role::CartesianY,
            b"cartesianZ" => Role::CartesianZ,
            b"sphericalRange" => Role::SphericalRange,
            b"sphericalAzimuth" => Role::SphericalAzimuth,
            b"sphericalElevation" => Role::SphericalElevation,
            b"rowIndex" => Role::RowIndex,
            b"columnIndex" => Role::ColumnIndex,
            b"returnCount" => Role::ReturnCount,
            b"returnIndex" => Role::ReturnIndex,
            b"timeStamp" => Role::TimeStamp,
            b"intensity" => Role::Intensity,
            b"colorRed" => Role::ColorRed,
            b"colorGreen" => Role::ColorGreen,
            b"colorBlue" => Role::ColorBlue,
            b"cartesianInvalidState" => Role::CartesianInvalidState,
            b"sphericalInvalidState" => Role::SphericalInvalidState,
            b"isTimeStampInvalid" => Role::IsTimeStampInvalid,
            b"isIntensityInvalid" => Role::IsIntensityInvalid,
            b"isColorInvalid" => Role::IsColorInvalid,
            _ => return None,
        })
    }

    /// The XML element name this role is declared with.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::CartesianX => "cartesianX",
            Role::CartesianY => "cartesianY",
            Role::CartesianZ => "cartesianZ",
            Role::SphericalRange => "sphericalRange",
            Role::SphericalAzimuth => "sphericalAzimuth",
            Role::SphericalElevation => "sphericalElevation",
            Role::RowIndex => "rowIndex",
            Role::ColumnIndex => "columnIndex",
            Role::ReturnCount => "returnCount",
            Role::ReturnIndex => "returnIndex",
            Role::TimeStamp => "timeStamp",
            Role::Intensity => "intensity",
            Role::ColorRed => "colorRed",
            Role::ColorGreen => "colorGreen",
            Role::ColorBlue => "colorBlue",
            Role::CartesianInvalidState => "cartesianInvalidState",
            Role::SphericalInvalidState => "sphericalInvalidState",
            Role::IsTimeStampInvalid => "isTimeStampInvalid",
            Role::IsIntensityInvalid => "isIntensityInvalid",
            Role::IsColorInvalid => "isColorInvalid",
        }
    }
}

/// Numeric type and range of one record component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentValue {
    /// Bit-packed integer in `[min, max]`
    Integer {
        /// Smallest encodable value
        min: i64,
        /// Largest encodable value
        max: i64,
        /// Bits per encoded value, `ceil(log2(max - min + 1))`
        bit_width: u8,
    },
    /// Bit-packed integer mapped to `scale * raw + offset`
    ScaledInteger {
        /// Smallest encodable raw value
        min: i64,
        /// Largest encodable raw value
        max: i64,
        /// Multiplier applied to the decoded raw value
        scale: f64,
        /// Offset added after scaling
        offset: f64,
        /// Bits per encoded value, `ceil(log2(max - min + 1))`
        bit_width: u8,
    },
    /// IEEE-754 single-precision value, 32 bits on the wire
    Float {
        /// Declared lower bound
        min: f64,
        /// Declared upper bound
        max: f64,
    },
    /// IEEE-754 double-precision value, 64 bits on the wire
    Double {
        /// Declared lower bound
        min: f64,
        /// Declared upper bound
        max: f64,
    },
}

impl ComponentValue {
    /// Name of the numeric type, as spelled in the XML `type` attribute.
    pub fn type_name(&self) -> &'static str {
        match self {
            ComponentValue::Integer { .. } => "Integer",
            ComponentValue::ScaledInteger { .. } => "ScaledInteger",
            ComponentValue::Float { .. } => "Float",
            ComponentValue::Double { .. } => "Double",
        }
    }

    /// Bits one encoded value occupies in its byte stream.
    pub fn bit_width(&self) -> u32 {
        match *self {
            ComponentValue::Integer { bit_width, .. }
            | ComponentValue::ScaledInteger { bit_width, .. } => u32::from(bit_width),
            ComponentValue::Float { .. } => 32,
            ComponentValue::Double { .. } => 64,
        }
    }
}

/// One component of a point record: what it means and how it is encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Component {
    /// Semantic meaning
    pub role: Role,
    /// Numeric type, range, and encoding
    pub value: ComponentValue,
}

/// One point set: a compressed-vector section plus its prototype.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSet {
    /// Physical offset of the compressed-vector section header
    pub file_offset: u64,
    /// Number of records in the section
    pub record_count: u64,
    /// Record components in prototype order; the order defines the
    /// byte-stream index used during decoding
    pub components: Vec<Component>,
}

/// An opened E57 file: validated header, decoded point-set
/// descriptors, and the state needed to stream records out.
///
/// A single `E57File` supports one decode operation at a time; open
/// several instances for concurrent decodes of the same underlying
/// bytes.
pub struct E57File<S> {
    pub(crate) source: S,
    file_size: u64,
    header: FileHeader,
    pub(crate) page: PageLayout,
    pub(crate) points: Vec<PointSet>,
    pub(crate) packets: PacketReader,
}

impl<S: ByteSource> E57File<S> {
    /// Opens an E57 file from a byte source.
    ///
    /// Validates the header, reads the embedded XML document through
    /// the CRC-checked paged reader, and decodes the point-set
    /// prototypes. Fails on header violations, XML parse failures, or
    /// descriptor validation failures.
    pub fn open(mut source: S, file_size: u64) -> Result<Self> {
        let (header, page) = parse_header(&mut source, file_size)?;

        let mut xml_bytes = vec![0u8; header.xml_logical_length as usize];
        let mut cursor = header.xml_physical_offset;
        read_paged(&mut source, &page, &mut cursor, &mut xml_bytes)?;

        let points = xml::parse_document(&xml_bytes)?;
        debug!(
            "opened E57 v{}.{}: {} point set(s)",
            header.major,
            header.minor,
            points.len()
        );

        Ok(Self {
            source,
            file_size,
            header,
            page,
            points,
            packets: PacketReader::new(),
        })
    }

    /// The parsed file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The page geometry derived from the header.
    pub fn page(&self) -> &PageLayout {
        &self.page
    }

    /// Size of the underlying byte source, as supplied to [`open`](Self::open).
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// The decoded point sets, in document order.
    pub fn points(&self) -> &[PointSet] {
        &self.points
    }

    /// Re-reads the embedded XML document.
    pub fn read_xml(&mut self) -> Result<Vec<u8>> {
        let mut xml_bytes = vec![0u8; self.header.xml_logical_length as usize];
        let mut cursor = self.header.xml_physical_offset;
        read_paged(&mut self.source, &self.page, &mut cursor, &mut xml_bytes)?;
        Ok(xml_bytes)
    }
}

fn parse_header<S: ByteSource>(source: &mut S, file_size: u64) -> Result<(FileHeader, PageLayout)> {
    if file_size < HEADER_SIZE as u64 {
        return Err(Error::header_invalid("file smaller than the 48-byte header"));
    }

    // The header sits at the start of the first page, before any
    // paged addressing applies, so it is read raw.
    let bytes = read_raw(source, 0, HEADER_SIZE)?;

    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(Error::header_invalid("wrong file signature"));
    }

    let header = FileHeader {
        major: u32_le(bytes, 8),
        minor: u32_le(bytes, 12),
        file_physical_length: u64_le(bytes, 16),
        xml_physical_offset: u64_le(bytes, 24),
        xml_logical_length: u64_le(bytes, 32),
        page_size: u64_le(bytes, 40),
    };

    if header.page_size == 0 || !header.page_size.is_power_of_two() {
        return Err(Error::header_invalid(format!(
            "page size {} is not a power of two",
            header.page_size
        )));
    }
    if header.page_size <= 4 {
        return Err(Error::header_invalid(format!(
            "page size {} leaves no payload after the checksum",
            header.page_size
        )));
    }
    if header.file_physical_length > file_size {
        return Err(Error::header_invalid(format!(
            "declared length {} exceeds file size {}",
            header.file_physical_length, file_size
        )));
    }

    let page = PageLayout::new(header.page_size);
    debug!(
        "header: v{}.{} pageSize={:#x} pageMask={:#x} pageShift={}",
        header.major, header.minor, page.size, page.mask, page.shift
    );

    Ok((header, page))
}
