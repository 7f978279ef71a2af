//! Error types for the e57dump-core library.
//!
//! This module provides comprehensive error handling using the `thiserror` crate,
//! with detailed error variants for different failure modes.

use thiserror::Error;

/// Result type alias for e57dump operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all e57dump operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The 48-byte file header failed validation
    #[error("invalid file header: {0}")]
    HeaderInvalid(String),

    /// A page checksum did not match its payload
    #[error("CRC mismatch on page {page}: expected {expected:#010x}, computed {computed:#010x}")]
    PageCrcMismatch {
        /// Page index counted from the start of the file
        page: u64,
        /// Reference checksum stored in the page tail
        expected: u32,
        /// Checksum computed over the page payload
        computed: u32,
    },

    /// The byte source returned fewer bytes than requested
    #[error("short read at offset {offset}: requested {requested} bytes, got {got}")]
    ShortRead {
        /// Physical offset of the read
        offset: u64,
        /// Number of bytes requested
        requested: usize,
        /// Number of bytes the source delivered
        got: usize,
    },

    /// The embedded XML document is not well-formed
    #[error("XML syntax error: {0}")]
    XmlSyntax(String),

    /// The XML document is well-formed but violates the E57 schema
    #[error("XML semantic error in <{element}>: {details}")]
    XmlSemantic {
        /// Name of the element being processed
        element: String,
        /// Detailed description of the violation
        details: String,
    },

    /// A component descriptor failed validation after XML parsing
    #[error("invalid component descriptor: {0}")]
    DescriptorInvalid(String),

    /// A compressed-vector packet failed validation
    #[error("malformed packet at offset {offset:#x}: {details}")]
    PacketMalformed {
        /// Physical offset of the packet start
        offset: u64,
        /// Detailed description of the issue
        details: String,
    },

    /// A compressed-vector section ended before all records were decoded
    #[error("section truncated: {records_left} records left at section end {section_end:#x}")]
    SectionTruncated {
        /// Physical offset of the section end
        section_end: u64,
        /// Number of records that were still expected
        records_left: u64,
    },

    /// The consume callback requested a stop
    #[error("consumer stopped the decode after {records_delivered} records")]
    ConsumerStop {
        /// Number of records delivered before the stop
        records_delivered: u64,
    },

    /// The file uses a feature this reader does not implement
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Creates a new header validation error
    pub fn header_invalid(details: impl Into<String>) -> Self {
        Self::HeaderInvalid(details.into())
    }

    /// Creates a new short read error
    pub fn short_read(offset: u64, requested: usize, got: usize) -> Self {
        Self::ShortRead {
            offset,
            requested,
            got,
        }
    }

    /// Creates a new XML syntax error
    pub fn xml_syntax(details: impl Into<String>) -> Self {
        Self::XmlSyntax(details.into())
    }

    /// Creates a new XML semantic error
    pub fn xml_semantic(element: impl Into<String>, details: impl Into<String>) -> Self {
        Self::XmlSemantic {
            element: element.into(),
            details: details.into(),
        }
    }

    /// Creates a new descriptor validation error
    pub fn descriptor_invalid(details: impl Into<String>) -> Self {
        Self::DescriptorInvalid(details.into())
    }

    /// Creates a new malformed packet error
    pub fn packet_malformed(offset: u64, details: impl Into<String>) -> Self {
        Self::PacketMalformed {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new unsupported feature error
    pub fn unsupported(details: impl Into<String>) -> Self {
        Self::Unsupported(details.into())
    }

    /// Returns true if the decode was aborted by the consume callback
    /// rather than by a defect in the file
    pub fn is_consumer_stop(&self) -> bool {
        matches!(self, Self::ConsumerStop { .. })
    }
}
