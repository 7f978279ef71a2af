//! XML binder: turns the embedded document into point-set prototypes.
//!
//! The tokenizer is `quick-xml`; this module consumes its pull events
//! and maintains a stack of element frames, each a tagged variant for
//! one of the element kinds the E57 schema defines. Points frames
//! collect their prototype components; everything else is either
//! descriptive (cartesian bounds) or ignored. After the event stream
//! ends, the finalizer validates the collected frames and computes the
//! bit width of every integer component.

use crate::error::{Error, Result};
use crate::file::{Component, ComponentValue, PointSet, Role};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use tracing::{debug, trace, warn};

/// One open element on the binder stack.
#[derive(Debug)]
enum Frame {
    Unknown,
    E57Root,
    Data3D,
    VectorChild,
    Name,
    Prototype,
    Images2D,
    CartesianBounds(Bounds),
    BoundsEdge(Edge),
    Points(PointsFrame),
    Component(RawComponent),
}

#[derive(Debug, Clone, Copy)]
enum Edge {
    XMin,
    XMax,
    YMin,
    YMax,
    ZMin,
    ZMax,
}

impl Edge {
    fn name(self) -> &'static str {
        match self {
            Edge::XMin => "xMinimum",
            Edge::XMax => "xMaximum",
            Edge::YMin => "yMinimum",
            Edge::YMax => "yMaximum",
            Edge::ZMin => "zMinimum",
            Edge::ZMax => "zMaximum",
        }
    }
}

/// Cartesian bounding box. Descriptive only; logged on exit.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    z_min: f64,
    z_max: f64,
}

impl Bounds {
    fn empty() -> Self {
        Self {
            x_min: f64::MAX,
            x_max: -f64::MAX,
            y_min: f64::MAX,
            y_max: -f64::MAX,
            z_min: f64::MAX,
            z_max: -f64::MAX,
        }
    }
}

/// A `points` element under construction.
#[derive(Debug)]
struct PointsFrame {
    file_offset: u64,
    record_count: u64,
    compressed_vector: bool,
    components: Vec<RawComponent>,
}

/// A prototype component before finalization. `value` stays `None`
/// until the `type` attribute is seen.
#[derive(Debug)]
struct RawComponent {
    role: Role,
    value: Option<Pending>,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Integer {
        min: i64,
        max: i64,
    },
    ScaledInteger {
        min: i64,
        max: i64,
        scale: f64,
        offset: f64,
    },
    Real {
        min: f64,
        max: f64,
        single: bool,
    },
}

struct Binder {
    stack: Vec<Frame>,
    collected: Vec<PointsFrame>,
}

/// Parses the embedded XML document into point sets.
pub(crate) fn parse_document(xml: &[u8]) -> Result<Vec<PointSet>> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut binder = Binder {
        stack: Vec::new(),
        collected: Vec::new(),
    };
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => binder.enter(&e)?,
            Ok(Event::Empty(e)) => {
                binder.enter(&e)?;
                binder.exit()?;
            }
            Ok(Event::End(_)) => binder.exit()?,
            Ok(Event::Text(t)) => binder.text(&t)?,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::xml_syntax(e.to_string())),
        }
        buf.clear();
    }

    if !binder.stack.is_empty() {
        return Err(Error::xml_syntax("document ended with unclosed elements"));
    }

    finalize(binder.collected)
}

fn frame_for(name: &[u8]) -> Frame {
    if let Some(role) = Role::from_element_name(name) {
        return Frame::Component(RawComponent { role, value: None });
    }
    match name {
        b"e57Root" => Frame::E57Root,
        b"data3D" => Frame::Data3D,
        b"vectorChild" => Frame::VectorChild,
        b"name" => Frame::Name,
        b"images2D" => Frame::Images2D,
        b"prototype" => Frame::Prototype,
        b"cartesianBounds" => Frame::CartesianBounds(Bounds::empty()),
        b"xMinimum" => Frame::BoundsEdge(Edge::XMin),
        b"xMaximum" => Frame::BoundsEdge(Edge::XMax),
        b"yMinimum" => Frame::BoundsEdge(Edge::YMin),
        b"yMaximum" => Frame::BoundsEdge(Edge::YMax),
        b"zMinimum" => Frame::BoundsEdge(Edge::ZMin),
        b"zMaximum" => Frame::BoundsEdge(Edge::ZMax),
        b"points" => Frame::Points(PointsFrame {
            file_offset: 0,
            record_count: 0,
            compressed_vector: false,
            components: Vec::new(),
        }),
        _ => Frame::Unknown,
    }
}

impl Binder {
    fn enter(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let qname = e.name();
        let name = qname.as_ref();
        trace!("{:1$}<{2}>", "", self.stack.len(), lossy(name));

        self.stack.push(frame_for(name));

        for attr in e.attributes() {
            let attr = attr.map_err(|err| Error::xml_syntax(err.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|err| Error::xml_syntax(err.to_string()))?;
            self.attribute(name, attr.key.as_ref(), &value)?;
        }
        Ok(())
    }

    /// Applies one attribute to the frame on top of the stack.
    /// Attributes carry meaning only on Points and Component frames.
    fn attribute(&mut self, element: &[u8], key: &[u8], value: &str) -> Result<()> {
        let frame = match self.stack.last_mut() {
            Some(frame) => frame,
            None => return Err(Error::xml_syntax("attribute outside any element")),
        };
        match frame {
            Frame::Points(points) => match key {
                b"type" => {
                    points.compressed_vector = value == "CompressedVector";
                    if !points.compressed_vector {
                        debug!("ignoring points element of type '{}'", value);
                    }
                }
                b"fileOffset" => points.file_offset = parse_u64(element, key, value)?,
                b"recordCount" => points.record_count = parse_u64(element, key, value)?,
                _ => {
                    return Err(Error::xml_semantic(
                        lossy(element),
                        format!("unknown attribute '{}'", lossy(key)),
                    ))
                }
            },
            Frame::Component(component) => component_attribute(component, element, key, value)?,
            _ => {}
        }
        Ok(())
    }

    /// Text only matters inside cartesianBounds, where each child
    /// element sets one edge of the rectangle.
    fn text(&mut self, t: &BytesText<'_>) -> Result<()> {
        let text = t
            .unescape()
            .map_err(|err| Error::xml_syntax(err.to_string()))?;
        let n = self.stack.len();
        if n < 2 {
            return Ok(());
        }
        if let Frame::BoundsEdge(edge) = self.stack[n - 1] {
            if let Frame::CartesianBounds(bounds) = &mut self.stack[n - 2] {
                let v = parse_f64(b"cartesianBounds", edge.name().as_bytes(), &text)?;
                match edge {
                    Edge::XMin => bounds.x_min = v,
                    Edge::XMax => bounds.x_max = v,
                    Edge::YMin => bounds.y_min = v,
                    Edge::YMax => bounds.y_max = v,
                    Edge::ZMin => bounds.z_min = v,
                    Edge::ZMax => bounds.z_max = v,
                }
            }
        }
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        let frame = match self.stack.pop() {
            Some(frame) => frame,
            None => return Err(Error::xml_syntax("unbalanced element close")),
        };
        match frame {
            Frame::CartesianBounds(b) => {
                debug!(
                    "cartesian bounds [{:.2} {:.2} {:.2}] x [{:.2} {:.2} {:.2}]",
                    b.x_min, b.y_min, b.z_min, b.x_max, b.y_max, b.z_max
                );
            }
            Frame::Points(points) => {
                trace!(
                    "collected points: fileOffset={:#x} recordCount={} components={}",
                    points.file_offset,
                    points.record_count,
                    points.components.len()
                );
                self.collected.push(points);
            }
            Frame::Component(raw) => {
                let n = self.stack.len();
                let in_prototype = n >= 2
                    && matches!(self.stack[n - 1], Frame::Prototype)
                    && matches!(self.stack[n - 2], Frame::Points(_));
                if !in_prototype {
                    return Err(Error::xml_semantic(
                        raw.role.as_str(),
                        "component element outside a points prototype",
                    ));
                }
                if let Frame::Points(points) = &mut self.stack[n - 2] {
                    points.components.push(raw);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Applies one attribute to a component frame. The `type` attribute
/// must precede the bound/scale/offset/precision attributes, since
/// their parse depends on it.
fn component_attribute(
    component: &mut RawComponent,
    element: &[u8],
    key: &[u8],
    value: &str,
) -> Result<()> {
    match key {
        b"type" => {
            if component.value.is_some() {
                return Err(Error::xml_semantic(lossy(element), "duplicate type attribute"));
            }
            component.value = Some(match value {
                "Integer" => Pending::Integer {
                    min: i64::MAX,
                    max: i64::MIN,
                },
                "ScaledInteger" => Pending::ScaledInteger {
                    min: i64::MAX,
                    max: i64::MIN,
                    scale: 1.0,
                    offset: 0.0,
                },
                "Float" => Pending::Real {
                    min: f64::MAX,
                    max: -f64::MAX,
                    single: false,
                },
                other => return Err(Error::unsupported(format!("component type '{other}'"))),
            });
        }
        b"minimum" | b"maximum" => {
            let is_min = key == b"minimum";
            match &mut component.value {
                None => {
                    return Err(Error::xml_semantic(
                        lossy(element),
                        format!("'{}' attribute before type", lossy(key)),
                    ))
                }
                Some(Pending::Integer { min, max })
                | Some(Pending::ScaledInteger { min, max, .. }) => {
                    let v = parse_i64(element, key, value)?;
                    if is_min {
                        *min = v;
                    } else {
                        *max = v;
                    }
                }
                Some(Pending::Real { min, max, .. }) => {
                    let v = parse_f64(element, key, value)?;
                    if is_min {
                        *min = v;
                    } else {
                        *max = v;
                    }
                }
            }
        }
        b"scale" | b"offset" => match &mut component.value {
            Some(Pending::ScaledInteger { scale, offset, .. }) => {
                let v = parse_f64(element, key, value)?;
                if key == b"scale" {
                    *scale = v;
                } else {
                    *offset = v;
                }
            }
            _ => {
                return Err(Error::xml_semantic(
                    lossy(element),
                    format!("'{}' is only valid on ScaledInteger", lossy(key)),
                ))
            }
        },
        b"precision" => match &mut component.value {
            Some(Pending::Real { single, .. }) => match value {
                "single" => *single = true,
                "double" => *single = false,
                // Misspelling observed in real inputs; treat as single
                "singe" => {
                    warn!(
                        "<{}>: tolerating misspelled precision 'singe' as 'single'",
                        lossy(element)
                    );
                    *single = true;
                }
                other => {
                    return Err(Error::xml_semantic(
                        lossy(element),
                        format!("unknown precision '{other}'"),
                    ))
                }
            },
            _ => {
                return Err(Error::xml_semantic(
                    lossy(element),
                    "precision is only valid on Float",
                ))
            }
        },
        _ => {
            return Err(Error::xml_semantic(
                lossy(element),
                format!("unknown attribute '{}'", lossy(key)),
            ))
        }
    }
    Ok(())
}

/// Flattens the collected points frames into point sets, skipping
/// frames that were not compressed vectors, and computes integer bit
/// widths.
fn finalize(collected: Vec<PointsFrame>) -> Result<Vec<PointSet>> {
    let mut points = Vec::new();
    for frame in collected {
        if !frame.compressed_vector {
            continue;
        }
        let mut components = Vec::with_capacity(frame.components.len());
        for raw in frame.components {
            components.push(finalize_component(raw)?);
        }
        points.push(PointSet {
            file_offset: frame.file_offset,
            record_count: frame.record_count,
            components,
        });
    }
    Ok(points)
}

fn finalize_component(raw: RawComponent) -> Result<Component> {
    let role = raw.role;
    let value = match raw.value {
        None => {
            return Err(Error::descriptor_invalid(format!(
                "{}: type never set",
                role.as_str()
            )))
        }
        Some(Pending::Integer { min, max }) => {
            check_int_bounds(role, min, max)?;
            ComponentValue::Integer {
                min,
                max,
                bit_width: integer_bit_width(min, max),
            }
        }
        Some(Pending::ScaledInteger {
            min,
            max,
            scale,
            offset,
        }) => {
            check_int_bounds(role, min, max)?;
            if scale == 0.0 {
                return Err(Error::descriptor_invalid(format!(
                    "{}: scale must be nonzero",
                    role.as_str()
                )));
            }
            ComponentValue::ScaledInteger {
                min,
                max,
                scale,
                offset,
                bit_width: integer_bit_width(min, max),
            }
        }
        Some(Pending::Real { min, max, single }) => {
            if max < min {
                return Err(Error::descriptor_invalid(format!(
                    "{}: minimum {} exceeds maximum {}",
                    role.as_str(),
                    min,
                    max
                )));
            }
            if single {
                ComponentValue::Float { min, max }
            } else {
                ComponentValue::Double { min, max }
            }
        }
    };
    Ok(Component { role, value })
}

fn check_int_bounds(role: Role, min: i64, max: i64) -> Result<()> {
    if min <= max {
        Ok(())
    } else {
        Err(Error::descriptor_invalid(format!(
            "{}: minimum {} exceeds maximum {}",
            role.as_str(),
            min,
            max
        )))
    }
}

/// Bits needed to encode values in `[min, max]`: `ceil(log2(span + 1))`
/// with the span taken as unsigned. A zero span needs no bits.
fn integer_bit_width(min: i64, max: i64) -> u8 {
    let span = max.wrapping_sub(min) as u64;
    (u64::BITS - span.leading_zeros()) as u8
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_u64(element: &[u8], key: &[u8], value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| malformed(element, key, value))
}

fn parse_i64(element: &[u8], key: &[u8], value: &str) -> Result<i64> {
    value.trim().parse().map_err(|_| malformed(element, key, value))
}

fn parse_f64(element: &[u8], key: &[u8], value: &str) -> Result<f64> {
    value.trim().parse().map_err(|_| malformed(element, key, value))
}

fn malformed(element: &[u8], key: &[u8], value: &str) -> Error {
    Error::xml_semantic(
        lossy(element),
        format!("malformed {} value '{}'", lossy(key), value),
    )
}
