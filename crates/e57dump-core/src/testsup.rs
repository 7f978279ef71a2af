//! Test support: synthetic E57 images built in memory.
//!
//! The builders here produce byte-exact files: CRC-paged images, data
//! packets with bit-packed streams, and complete files with header,
//! compressed-vector section, and embedded XML document.

use crate::file::{ByteSource, PageLayout};
use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Splits a logical byte string into pages, padding the last page with
/// zeros and appending each page's big-endian CRC-32C.
pub(crate) fn paginate(logical: &[u8], page_size: usize) -> Vec<u8> {
    let logical_size = page_size - 4;
    let mut out = Vec::new();
    let mut at = 0;
    while at < logical.len() {
        let end = (at + logical_size).min(logical.len());
        let mut page = logical[at..end].to_vec();
        page.resize(logical_size, 0);
        let crc = CASTAGNOLI.checksum(&page);
        out.extend_from_slice(&page);
        out.extend_from_slice(&crc.to_be_bytes());
        at = end;
    }
    out
}

/// Appends values to a little-endian bit stream, low bits first.
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit_len: 0,
        }
    }

    pub(crate) fn push(&mut self, value: u64, width: u32) {
        for i in 0..width {
            let byte = self.bit_len / 8;
            let bit = self.bit_len % 8;
            if byte == self.bytes.len() {
                self.bytes.push(0);
            }
            self.bytes[byte] |= (((value >> i) & 1) as u8) << bit;
            self.bit_len += 1;
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Builds a data packet from per-stream payloads, padded to a multiple
/// of four bytes.
pub(crate) fn data_packet(streams: &[Vec<u8>]) -> Vec<u8> {
    let mut pkt = vec![1u8, 0, 0, 0];
    pkt.extend_from_slice(&(streams.len() as u16).to_le_bytes());
    for s in streams {
        pkt.extend_from_slice(&(s.len() as u16).to_le_bytes());
    }
    for s in streams {
        pkt.extend_from_slice(s);
    }
    while pkt.len() % 4 != 0 {
        pkt.push(0);
    }
    let len = pkt.len();
    pkt[2..4].copy_from_slice(&((len - 1) as u16).to_le_bytes());
    pkt
}

/// Builds an empty (padding) packet of `size` total bytes.
pub(crate) fn empty_packet(size: usize) -> Vec<u8> {
    assert!(size >= 4);
    let mut pkt = vec![2u8, 0, 0, 0];
    pkt.resize(size, 0);
    pkt[2..4].copy_from_slice(&((size - 1) as u16).to_le_bytes());
    pkt
}

/// Builds an index packet with the given (record number, offset) entries.
pub(crate) fn index_packet(entries: &[(u64, u64)]) -> Vec<u8> {
    let mut pkt = vec![0u8; 16];
    pkt[4..6].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    for (record, offset) in entries {
        pkt.extend_from_slice(&record.to_le_bytes());
        pkt.extend_from_slice(&offset.to_le_bytes());
    }
    let len = pkt.len();
    pkt[2..4].copy_from_slice(&((len - 1) as u16).to_le_bytes());
    pkt
}

/// A byte source that counts how often it is called.
pub(crate) struct CountingSource<'a> {
    data: &'a [u8],
    reads: usize,
}

impl<'a> CountingSource<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, reads: 0 }
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads
    }
}

impl ByteSource for CountingSource<'_> {
    fn read(&mut self, offset: u64, len: usize) -> &[u8] {
        self.reads += 1;
        let Ok(start) = usize::try_from(offset) else {
            return &[];
        };
        if start > self.data.len() {
            return &[];
        }
        let end = start.saturating_add(len).min(self.data.len());
        &self.data[start..end]
    }
}

/// Accumulates the logical byte string of a file under construction.
pub(crate) struct FileBuilder {
    logical: Vec<u8>,
    page_size: u64,
}

/// A complete synthetic E57 file.
pub(crate) struct BuiltFile {
    /// The paginated physical image
    pub(crate) bytes: Vec<u8>,
    /// The embedded XML document
    pub(crate) xml: Vec<u8>,
    /// Physical offset of the compressed-vector section header
    pub(crate) section_at: u64,
    /// Physical offset of the XML document
    pub(crate) xml_at: u64,
}

impl FileBuilder {
    pub(crate) fn new(page_size: u64) -> Self {
        Self {
            logical: vec![0u8; 48],
            page_size,
        }
    }

    fn layout(&self) -> PageLayout {
        PageLayout::new(self.page_size)
    }

    /// Physical offset the next appended byte will land at.
    pub(crate) fn physical_pos(&self) -> u64 {
        self.layout().physical_offset(self.logical.len() as u64)
    }

    /// Appends a compressed-vector section holding `packets`, returning
    /// its physical offset. The section logical length can be
    /// overridden to simulate truncation.
    pub(crate) fn add_section(&mut self, packets: &[Vec<u8>], logical_length: Option<u64>) -> u64 {
        let section_at = self.physical_pos();
        let packets_len: usize = packets.iter().map(Vec::len).sum();
        let logical_length = logical_length.unwrap_or((32 + packets_len) as u64);
        let data_physical = self
            .layout()
            .physical_offset(self.logical.len() as u64 + 32);

        let mut header = [0u8; 32];
        header[0] = 1;
        header[8..16].copy_from_slice(&logical_length.to_le_bytes());
        header[16..24].copy_from_slice(&data_physical.to_le_bytes());
        self.logical.extend_from_slice(&header);
        for p in packets {
            self.logical.extend_from_slice(p);
        }
        section_at
    }

    /// Appends the XML document and finishes the file: fills the
    /// header fields and paginates the logical image.
    pub(crate) fn finish(mut self, xml: &[u8]) -> (Vec<u8>, u64) {
        let xml_at = self.physical_pos();
        self.logical.extend_from_slice(xml);

        let logical_size = self.page_size as usize - 4;
        let pages = self.logical.len().div_ceil(logical_size);
        let physical_len = (pages * self.page_size as usize) as u64;

        self.logical[0..8].copy_from_slice(b"ASTM-E57");
        self.logical[8..12].copy_from_slice(&1u32.to_le_bytes());
        self.logical[12..16].copy_from_slice(&0u32.to_le_bytes());
        self.logical[16..24].copy_from_slice(&physical_len.to_le_bytes());
        self.logical[24..32].copy_from_slice(&xml_at.to_le_bytes());
        self.logical[32..40].copy_from_slice(&(xml.len() as u64).to_le_bytes());
        self.logical[40..48].copy_from_slice(&self.page_size.to_le_bytes());

        (paginate(&self.logical, self.page_size as usize), xml_at)
    }
}

/// Renders the standard document wrapper around a prototype.
pub(crate) fn points_xml(section_at: u64, record_count: u64, prototype: &str) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <e57Root type=\"Structure\">\
         <data3D type=\"Vector\">\
         <vectorChild type=\"Structure\">\
         <points type=\"CompressedVector\" fileOffset=\"{section_at}\" recordCount=\"{record_count}\">\
         <prototype type=\"Structure\">{prototype}</prototype>\
         </points>\
         </vectorChild>\
         </data3D>\
         </e57Root>"
    )
    .into_bytes()
}

/// Builds a complete one-point-set file.
pub(crate) fn build_file(
    page_size: u64,
    packets: &[Vec<u8>],
    record_count: u64,
    prototype: &str,
    section_logical_length: Option<u64>,
) -> BuiltFile {
    let mut builder = FileBuilder::new(page_size);
    let section_at = builder.add_section(packets, section_logical_length);
    let xml = points_xml(section_at, record_count, prototype);
    let (bytes, xml_at) = builder.finish(&xml);
    BuiltFile {
        bytes,
        xml,
        section_at,
        xml_at,
    }
}

/// The minimal file of the documentation examples: one ScaledInteger
/// cartesianX component, three records.
pub(crate) fn minimal_scaled_integer_file() -> BuiltFile {
    let mut w = BitWriter::new();
    for raw in [0u64, 1000, 2000] {
        w.push(raw, 11);
    }
    let pkt = data_packet(&[w.into_bytes()]);
    build_file(
        1024,
        &[pkt],
        3,
        "<cartesianX type=\"ScaledInteger\" minimum=\"-1000\" maximum=\"1000\" \
         scale=\"0.001\" offset=\"0\"/>",
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate_produces_whole_pages() {
        let file = paginate(&[1u8; 100], 64);
        assert_eq!(file.len(), 128);
    }

    #[test]
    fn test_bit_writer_packs_lsb_first() {
        let mut w = BitWriter::new();
        w.push(0b101, 3);
        w.push(0b11111, 5);
        assert_eq!(w.into_bytes(), vec![0b11111_101]);
    }

    #[test]
    fn test_data_packet_is_padded_to_four() {
        let pkt = data_packet(&[vec![0xAB; 3]]);
        assert_eq!(pkt.len() % 4, 0);
        assert_eq!(pkt[0], 1);
        assert_eq!(u16::from_le_bytes([pkt[2], pkt[3]]) as usize + 1, pkt.len());
    }
}
