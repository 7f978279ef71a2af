//! Compressed-vector decoding: packet reading, bit unpacking, and the
//! record scheduler.
//!
//! ## Decoding model
//!
//! A data packet carries one fragment of every component's byte
//! stream, but the fragments drain at different rates: a component
//! packed with fewer bits per value outlasts a wider one. The
//! scheduler therefore keeps an independent packet cursor per output
//! stream and re-fetches packets per stream as each runs dry. The
//! single-entry packet cache makes re-addressing a stream's current
//! packet free when the scratch buffer already holds it.

pub(crate) mod bitpack;
pub(crate) mod packet;

use crate::error::{Error, Result};
use crate::file::{ByteSource, E57File};
use bitpack::{consume_bits, UnpackDesc, UnpackState};
use packet::SectionHeader;
use tracing::{debug, trace};

/// Selects one component for output and where its values land in the
/// interleaved buffer. Offsets and strides count `f32` elements.
#[derive(Debug, Clone, Copy)]
pub struct WriteDesc {
    /// Index of the first value's slot in the output buffer
    pub offset: usize,
    /// Distance between consecutive values, in elements
    pub stride: usize,
    /// Index into the point set's components
    pub stream: usize,
}

/// Decode progress of one output stream.
#[derive(Debug)]
struct StreamCursor {
    /// Component (and byte stream) index in the prototype
    component: usize,
    lane_offset: usize,
    lane_stride: usize,
    /// Start of the packet being decoded; once exhausted, the next
    /// packet to fetch for this stream
    packet_offset: u64,
    unpack: UnpackState,
    desc: UnpackDesc,
}

impl<S: ByteSource> E57File<S> {
    /// Streams one point set into a caller-supplied interleaved buffer.
    ///
    /// Records are decoded in batches of at most `point_capacity`. For
    /// each batch, value `i` of the component named by a descriptor's
    /// `stream` is written to `out[offset + stride * i]`, then
    /// `consume` is invoked with the buffer and the batch size.
    /// Batches arrive in record order; the sum of batch sizes equals
    /// the point set's record count. Returning `false` from `consume`
    /// stops the decode with [`Error::ConsumerStop`].
    ///
    /// All values are delivered as `f32` regardless of the component's
    /// declared type; wider types are down-converted.
    ///
    /// # Panics
    ///
    /// Panics if `point_set` is out of range, `point_capacity` is
    /// zero, a descriptor names a stream outside the prototype, or
    /// `out` cannot hold `point_capacity` records.
    pub fn read_points<F>(
        &mut self,
        point_set: usize,
        write: &[WriteDesc],
        out: &mut [f32],
        point_capacity: usize,
        mut consume: F,
    ) -> Result<()>
    where
        F: FnMut(&[f32], usize) -> bool,
    {
        assert!(
            point_set < self.points.len(),
            "point set {point_set} out of range"
        );
        assert!(point_capacity > 0, "point capacity must be positive");
        let pts = &self.points[point_set];
        for desc in write {
            assert!(
                desc.stream < pts.components.len(),
                "stream {} outside the {}-component prototype",
                desc.stream,
                pts.components.len()
            );
            assert!(
                desc.offset + desc.stride * (point_capacity - 1) < out.len(),
                "output buffer too small for {point_capacity} records"
            );
        }

        debug!(
            "reading {} records from point set {} ({} components, {} output fields)",
            pts.record_count,
            point_set,
            pts.components.len(),
            write.len()
        );

        let section = SectionHeader::read(&mut self.source, &self.page, pts.file_offset)?;
        let stream_count = pts.components.len();
        self.packets.reset();

        let mut streams: Vec<StreamCursor> = write
            .iter()
            .map(|w| StreamCursor {
                component: w.stream,
                lane_offset: w.offset,
                lane_stride: w.stride,
                packet_offset: section.data_physical_offset,
                unpack: UnpackState::drained(),
                desc: UnpackDesc::default(),
            })
            .collect();

        let mut points_left = pts.record_count;
        let mut delivered: u64 = 0;

        while points_left > 0 {
            let batch = points_left.min(point_capacity as u64) as usize;
            for s in &mut streams {
                s.unpack.items_written = 0;
                s.desc.max_items = batch;
            }

            loop {
                let mut done = true;
                for s in &mut streams {
                    if s.unpack.items_written >= s.desc.max_items {
                        continue;
                    }

                    // Bring this stream's packet into the scratch
                    // buffer: the next one in its chain when exhausted,
                    // otherwise the packet it is mid-way through (free
                    // when the scratch still holds it).
                    let loaded = self.packets.load_data(
                        &mut self.source,
                        &self.page,
                        s.packet_offset,
                        section.physical_end,
                        stream_count,
                    )?;
                    let Some(packet) = loaded else {
                        return Err(Error::SectionTruncated {
                            section_end: section.physical_end,
                            records_left: points_left,
                        });
                    };
                    if s.unpack.exhausted() {
                        s.packet_offset = packet.start;
                        let extent = self.packets.stream_extent(s.component)?;
                        s.desc.byte_stream_offset = extent.byte_offset;
                        s.desc.bits_available = extent.bit_count;
                        s.unpack.bits_consumed = 0;
                    }

                    let before = s.unpack.items_written;
                    consume_bits(
                        self.packets.scratch(),
                        &pts.components[s.component].value,
                        &mut s.unpack,
                        &s.desc,
                        out,
                        s.lane_offset,
                        s.lane_stride,
                    );
                    debug_assert!(
                        s.unpack.exhausted() || s.unpack.items_written > before,
                        "bit unpacker made no progress"
                    );

                    if s.unpack.exhausted() {
                        s.packet_offset = packet.next_offset;
                    }
                    if s.unpack.items_written < s.desc.max_items {
                        done = false;
                    }
                }
                if done {
                    break;
                }
            }

            trace!("delivering batch of {} records", batch);
            if !consume(out, batch) {
                return Err(Error::ConsumerStop {
                    records_delivered: delivered,
                });
            }
            delivered += batch as u64;
            points_left -= batch as u64;
        }

        Ok(())
    }
}
