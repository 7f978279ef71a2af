//! Compressed-vector section and packet reader.
//!
//! A section starts with a 32-byte header and is filled with packets:
//! data packets carrying aligned fragments of every component stream,
//! index packets (validated, then ignored), and empty packets used as
//! padding. Packets are read whole into a scratch buffer through the
//! paged reader; the most recently read packet is kept, keyed by its
//! starting offset, so the scheduler can re-address a stream's current
//! packet without I/O.

use crate::bytes::{u16_le, u64_le};
use crate::error::{Error, Result};
use crate::file::{read_paged, ByteSource, PageLayout};
use tracing::{debug, trace};

/// Packet payloads are sized by a 16-bit field, so 64 KiB at most.
pub(crate) const MAX_PACKET_SIZE: usize = 0x10000;

/// Scratch size: the extra eight bytes let the bit-pack decoder load a
/// full 64-bit word at any in-packet byte offset.
pub(crate) const SCRATCH_SIZE: usize = MAX_PACKET_SIZE + 8;

/// Fixed prefix shared by every packet: type, flags, size-minus-one.
const PACKET_PREFIX_SIZE: usize = 4;

/// Section id of a compressed-vector section.
pub(crate) const SECTION_ID: u8 = 1;

/// Size of the compressed-vector section header.
pub(crate) const SECTION_HEADER_SIZE: usize = 32;

/// Sentinel for "nothing cached".
const NO_PACKET: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Index,
    Data,
    Empty,
}

impl PacketKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketKind::Index),
            1 => Some(PacketKind::Data),
            2 => Some(PacketKind::Empty),
            _ => None,
        }
    }
}

/// The compressed-vector section header fronting a point set's packets.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionHeader {
    /// Physical offset of the first data packet
    pub(crate) data_physical_offset: u64,
    /// Physical offset just past the section
    pub(crate) physical_end: u64,
}

impl SectionHeader {
    /// Reads and validates a section header at `offset`.
    pub(crate) fn read<S: ByteSource>(
        source: &mut S,
        layout: &PageLayout,
        offset: u64,
    ) -> Result<Self> {
        let mut bytes = [0u8; SECTION_HEADER_SIZE];
        let mut cursor = offset;
        read_paged(source, layout, &mut cursor, &mut bytes)?;

        if bytes[0] != SECTION_ID {
            return Err(Error::packet_malformed(
                offset,
                format!("expected section id {:#x}, got {:#x}", SECTION_ID, bytes[0]),
            ));
        }

        let logical_length = u64_le(&bytes, 8);
        let data_physical_offset = u64_le(&bytes, 16);
        let index_physical_offset = u64_le(&bytes, 24);

        let logical_end = layout.logical_offset(offset) + logical_length;
        let physical_end = layout.physical_offset(logical_end);

        debug!(
            "section at {:#x}: logicalLength={:#x} dataOffset={:#x} indexOffset={:#x} physicalEnd={:#x}",
            offset, logical_length, data_physical_offset, index_physical_offset, physical_end
        );

        Ok(Self {
            data_physical_offset,
            physical_end,
        })
    }
}

/// Location of a loaded data packet in the file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataPacket {
    /// Physical offset of the packet's first byte
    pub(crate) start: u64,
    /// Physical offset just past the packet
    pub(crate) next_offset: u64,
}

/// Extent of one component's byte stream inside a loaded data packet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamExtent {
    /// Absolute offset of the stream's first byte in the scratch buffer
    pub(crate) byte_offset: usize,
    /// Bits the stream occupies in this packet
    pub(crate) bit_count: u32,
}

/// Packet scratch buffer plus the parsed state of the packet it holds.
pub(crate) struct PacketReader {
    scratch: Box<[u8]>,
    start: u64,
    size: usize,
    next_offset: u64,
    /// Per-stream start offsets plus one trailing sentinel; data
    /// packets only
    stream_offsets: Vec<usize>,
}

impl PacketReader {
    pub(crate) fn new() -> Self {
        Self {
            scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
            start: NO_PACKET,
            size: 0,
            next_offset: 0,
            stream_offsets: Vec::new(),
        }
    }

    /// The buffer holding the current packet. Its trailing slack makes
    /// 8-byte loads safe at any in-packet offset.
    pub(crate) fn scratch(&self) -> &[u8] {
        &self.scratch
    }

    /// Forgets the cached packet, forcing the next load to re-read.
    pub(crate) fn reset(&mut self) {
        self.start = NO_PACKET;
    }

    /// Loads the data packet at `offset`, skipping empty and index
    /// packets in between. Returns `None` if only padding remains
    /// before `section_end`. Loading the already-cached offset is free.
    pub(crate) fn load_data<S: ByteSource>(
        &mut self,
        source: &mut S,
        layout: &PageLayout,
        offset: u64,
        section_end: u64,
        stream_count: usize,
    ) -> Result<Option<DataPacket>> {
        if self.start == offset {
            return Ok(Some(DataPacket {
                start: offset,
                next_offset: self.next_offset,
            }));
        }

        let mut at = offset;
        loop {
            if at >= section_end {
                return Ok(None);
            }
            match self.fetch(source, layout, at)? {
                PacketKind::Data => {
                    self.index_streams(at, stream_count)?;
                    self.start = at;
                    return Ok(Some(DataPacket {
                        start: at,
                        next_offset: self.next_offset,
                    }));
                }
                PacketKind::Empty => {
                    trace!("skipping empty packet at {:#x} ({} bytes)", at, self.size);
                    at = self.next_offset;
                }
                PacketKind::Index => {
                    self.validate_index(at)?;
                    at = self.next_offset;
                }
            }
        }
    }

    /// The extent of stream `stream` in the currently loaded data packet.
    pub(crate) fn stream_extent(&self, stream: usize) -> Result<StreamExtent> {
        if stream + 1 >= self.stream_offsets.len() {
            return Err(Error::packet_malformed(
                self.start,
                format!(
                    "stream {} missing from packet with {} streams",
                    stream,
                    self.stream_offsets.len().saturating_sub(1)
                ),
            ));
        }
        let begin = self.stream_offsets[stream];
        let end = self.stream_offsets[stream + 1];
        Ok(StreamExtent {
            byte_offset: begin,
            bit_count: 8 * (end - begin) as u32,
        })
    }

    /// Reads the packet at `offset` into the scratch buffer and parses
    /// its prefix. Returns the packet kind; the cache is invalidated
    /// until the caller accepts the packet.
    fn fetch<S: ByteSource>(
        &mut self,
        source: &mut S,
        layout: &PageLayout,
        offset: u64,
    ) -> Result<PacketKind> {
        self.start = NO_PACKET;

        let mut cursor = offset;
        let (prefix, rest) = self.scratch.split_at_mut(PACKET_PREFIX_SIZE);
        read_paged(source, layout, &mut cursor, prefix)?;

        let kind = PacketKind::from_u8(prefix[0]).ok_or_else(|| {
            Error::packet_malformed(offset, format!("unrecognized packet type {:#x}", prefix[0]))
        })?;
        let size = u16_le(prefix, 2) as usize + 1;
        if size < PACKET_PREFIX_SIZE {
            return Err(Error::packet_malformed(
                offset,
                format!("packet size {} is less than the 4-byte prefix", size),
            ));
        }

        read_paged(
            source,
            layout,
            &mut cursor,
            &mut rest[..size - PACKET_PREFIX_SIZE],
        )?;

        self.size = size;
        self.next_offset = cursor;
        Ok(kind)
    }

    /// Validates an index packet's shape. The entries themselves are
    /// not used; sequential decoding never consults them.
    fn validate_index(&self, offset: u64) -> Result<()> {
        const ENTRY_SIZE: usize = 16;
        const PAYLOAD_START: usize = 16;
        if self.size < PAYLOAD_START {
            return Err(Error::packet_malformed(
                offset,
                format!("index packet size {} is below the 16-byte header", self.size),
            ));
        }
        let entry_count = u16_le(&self.scratch, 4) as usize;
        let index_level = self.scratch[6];
        if self.size < PAYLOAD_START + entry_count * ENTRY_SIZE {
            return Err(Error::packet_malformed(
                offset,
                format!(
                    "index packet size {} cannot hold {} entries",
                    self.size, entry_count
                ),
            ));
        }
        trace!(
            "index packet at {:#x}: size={} entryCount={} indexLevel={}",
            offset,
            self.size,
            entry_count,
            index_level
        );
        Ok(())
    }

    /// Builds the per-stream offset table for the data packet in the
    /// scratch buffer.
    fn index_streams(&mut self, offset: u64, stream_count: usize) -> Result<()> {
        if self.size % 4 != 0 {
            return Err(Error::packet_malformed(
                offset,
                format!("data packet size {} is not a multiple of 4", self.size),
            ));
        }
        if self.size < 6 {
            return Err(Error::packet_malformed(
                offset,
                format!("data packet size {} is below the 6-byte header", self.size),
            ));
        }

        let count = u16_le(&self.scratch, 4) as usize;
        if count == 0 {
            return Err(Error::packet_malformed(offset, "no byte streams in packet"));
        }
        if count != stream_count {
            return Err(Error::packet_malformed(
                offset,
                format!(
                    "packet has {} byte streams, prototype has {} components",
                    count, stream_count
                ),
            ));
        }

        let table_end = 6 + 2 * count;
        if self.size < table_end {
            return Err(Error::packet_malformed(
                offset,
                format!(
                    "data packet size {} cannot hold {} stream lengths",
                    self.size, count
                ),
            ));
        }

        self.stream_offsets.clear();
        self.stream_offsets.reserve(count + 1);
        let mut at = table_end;
        self.stream_offsets.push(at);
        for i in 0..count {
            at += u16_le(&self.scratch, 6 + 2 * i) as usize;
            if at > self.size {
                return Err(Error::packet_malformed(
                    offset,
                    format!("byte stream {} spans outside the packet", i),
                ));
            }
            self.stream_offsets.push(at);
        }

        trace!(
            "data packet at {:#x}: size={} streams={}",
            offset,
            self.size,
            count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsup::{data_packet, empty_packet, index_packet, paginate, CountingSource};

    const PAGE: u64 = 256;

    fn layout() -> PageLayout {
        PageLayout::new(PAGE)
    }

    fn paged(logical: &[u8]) -> Vec<u8> {
        paginate(logical, PAGE as usize)
    }

    #[test]
    fn test_data_packet_stream_indexing() {
        let logical = data_packet(&[vec![1, 2, 3], vec![4, 5], vec![6, 7, 8, 9]]);
        let file = paged(&logical);
        let mut reader = PacketReader::new();
        let pkt = reader
            .load_data(&mut file.as_slice(), &layout(), 0, u64::MAX, 3)
            .unwrap()
            .unwrap();
        assert_eq!(pkt.start, 0);

        // Streams start after the 6-byte header and three u16 lengths
        let s0 = reader.stream_extent(0).unwrap();
        assert_eq!(s0.byte_offset, 12);
        assert_eq!(s0.bit_count, 24);
        let s2 = reader.stream_extent(2).unwrap();
        assert_eq!(s2.byte_offset, 17);
        assert_eq!(s2.bit_count, 32);
        assert_eq!(&reader.scratch()[12..15], &[1, 2, 3]);
        assert_eq!(&reader.scratch()[17..21], &[6, 7, 8, 9]);
    }

    #[test]
    fn test_cached_packet_needs_no_io() {
        let logical = data_packet(&[vec![0u8; 8]]);
        let file = paged(&logical);
        let mut source = CountingSource::new(&file);
        let mut reader = PacketReader::new();

        reader
            .load_data(&mut source, &layout(), 0, u64::MAX, 1)
            .unwrap()
            .unwrap();
        let reads_after_first = source.reads();
        reader
            .load_data(&mut source, &layout(), 0, u64::MAX, 1)
            .unwrap()
            .unwrap();
        assert_eq!(source.reads(), reads_after_first);
    }

    #[test]
    fn test_empty_and_index_packets_are_skipped() {
        let mut logical = Vec::new();
        logical.extend_from_slice(&empty_packet(8));
        logical.extend_from_slice(&index_packet(&[(0, 0)]));
        let data_at = logical.len() as u64;
        logical.extend_from_slice(&data_packet(&[vec![9, 9]]));
        let file = paged(&logical);

        let mut reader = PacketReader::new();
        let pkt = reader
            .load_data(&mut file.as_slice(), &layout(), 0, u64::MAX, 1)
            .unwrap()
            .unwrap();
        assert_eq!(pkt.start, data_at);
    }

    #[test]
    fn test_padding_to_section_end_yields_none() {
        let logical = empty_packet(12);
        let end = logical.len() as u64;
        let file = paged(&logical);
        let mut reader = PacketReader::new();
        let got = reader
            .load_data(&mut file.as_slice(), &layout(), 0, end, 1)
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_unrecognized_packet_type_is_fatal() {
        let logical = vec![7u8, 0, 3, 0]; // type 7 does not exist
        let file = paged(&logical);
        let mut reader = PacketReader::new();
        let err = reader
            .load_data(&mut file.as_slice(), &layout(), 0, u64::MAX, 1)
            .unwrap_err();
        assert!(matches!(err, Error::PacketMalformed { .. }));
    }

    #[test]
    fn test_size_not_multiple_of_four_is_fatal() {
        // Hand-build a 10-byte data packet: header + one stream length + 2 bytes
        let logical = vec![1u8, 0, 9, 0, 1, 0, 2, 0, 0xAA, 0xBB];
        let file = paged(&logical);
        let mut reader = PacketReader::new();
        let err = reader
            .load_data(&mut file.as_slice(), &layout(), 0, u64::MAX, 1)
            .unwrap_err();
        assert!(matches!(err, Error::PacketMalformed { .. }));
    }

    #[test]
    fn test_stream_count_mismatch_is_fatal() {
        let logical = data_packet(&[vec![1], vec![2]]);
        let file = paged(&logical);
        let mut reader = PacketReader::new();
        let err = reader
            .load_data(&mut file.as_slice(), &layout(), 0, u64::MAX, 3)
            .unwrap_err();
        assert!(matches!(err, Error::PacketMalformed { .. }));
    }

    #[test]
    fn test_stream_spanning_outside_packet_is_fatal() {
        // Stream length claims 200 bytes but the packet is 12 bytes
        let mut logical = vec![1u8, 0, 11, 0, 1, 0, 200, 0];
        logical.extend_from_slice(&[0u8; 4]);
        let file = paged(&logical);
        let mut reader = PacketReader::new();
        let err = reader
            .load_data(&mut file.as_slice(), &layout(), 0, u64::MAX, 1)
            .unwrap_err();
        assert!(matches!(err, Error::PacketMalformed { .. }));
    }

    #[test]
    fn test_section_header_parse() {
        let mut logical = vec![0u8; SECTION_HEADER_SIZE];
        logical[0] = SECTION_ID;
        logical[8..16].copy_from_slice(&100u64.to_le_bytes()); // logical length
        logical[16..24].copy_from_slice(&32u64.to_le_bytes()); // data offset
        let file = paged(&logical);

        let header = SectionHeader::read(&mut file.as_slice(), &layout(), 0).unwrap();
        assert_eq!(header.data_physical_offset, 32);
        assert_eq!(header.physical_end, 100);
    }

    #[test]
    fn test_wrong_section_id_is_fatal() {
        let logical = vec![9u8; SECTION_HEADER_SIZE];
        let file = paged(&logical);
        let err = SectionHeader::read(&mut file.as_slice(), &layout(), 0).unwrap_err();
        assert!(matches!(err, Error::PacketMalformed { .. }));
    }
}
