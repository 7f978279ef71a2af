//! e57dump - inspect and extract point clouds from ASTM E57 files
//!
//! This tool prints the structure of an E57 file, extracts its embedded
//! XML document, and decodes point sets into ASCII `.pts` files.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use e57dump_core::{Component, ComponentValue, E57File, PointSet, Role, WriteDesc};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// Inspect and extract point clouds from ASTM E57 files
#[derive(Parser, Debug)]
#[command(name = "e57dump")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the .e57 file to inspect
    file: PathBuf,

    /// Print the file header and point-set summary (the default when no
    /// extraction is requested)
    #[arg(long)]
    info: bool,

    /// Write the embedded XML document to this path
    #[arg(long, value_name = "PATH")]
    xml: Option<PathBuf>,

    /// Decode a point set into an ASCII .pts file at this path
    #[arg(long, value_name = "PATH")]
    pts: Option<PathBuf>,

    /// Point set to decode with --pts
    #[arg(long, default_value = "0", value_name = "INDEX")]
    point_set: usize,

    /// Components to write with --pts, in output order
    #[arg(
        long,
        value_delimiter = ',',
        value_enum,
        default_values = ["x", "y", "z"]
    )]
    components: Vec<PtsComponent>,

    /// Records decoded per batch with --pts
    #[arg(long, default_value = "4096", value_name = "COUNT")]
    batch: usize,

    /// Overwrite existing output files
    #[arg(long)]
    force: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Components selectable for .pts output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PtsComponent {
    /// Cartesian X
    X,
    /// Cartesian Y
    Y,
    /// Cartesian Z
    Z,
    /// Spherical range
    Range,
    /// Spherical azimuth
    Azimuth,
    /// Spherical elevation
    Elevation,
    /// Row index
    Row,
    /// Column index
    Column,
    /// Timestamp
    Time,
    /// Intensity
    Intensity,
    /// Red color channel
    Red,
    /// Green color channel
    Green,
    /// Blue color channel
    Blue,
}

impl PtsComponent {
    fn role(self) -> Role {
        match self {
            PtsComponent::X => Role::CartesianX,
            PtsComponent::Y => Role::CartesianY,
            PtsComponent::Z => Role::CartesianZ,
            PtsComponent::Range => Role::SphericalRange,
            PtsComponent::Azimuth => Role::SphericalAzimuth,
            PtsComponent::Elevation => Role::SphericalElevation,
            PtsComponent::Row => Role::RowIndex,
            PtsComponent::Column => Role::ColumnIndex,
            PtsComponent::Time => Role::TimeStamp,
            PtsComponent::Intensity => Role::Intensity,
            PtsComponent::Red => Role::ColorRed,
            PtsComponent::Green => Role::ColorGreen,
            PtsComponent::Blue => Role::ColorBlue,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    if !cli.file.exists() {
        bail!("input file does not exist: {}", cli.file.display());
    }

    debug!("reading {}", cli.file.display());
    let data = fs::read(&cli.file)
        .with_context(|| format!("failed to read input file: {}", cli.file.display()))?;
    let size = data.len() as u64;
    let mut e57 = E57File::open(data, size)
        .with_context(|| format!("failed to open {}", cli.file.display()))?;

    let extracting = cli.xml.is_some() || cli.pts.is_some();
    if cli.info || !extracting {
        print_info(&cli, &e57);
    }
    if let Some(ref path) = cli.xml {
        extract_xml(&cli, &mut e57, path)?;
    }
    if let Some(ref path) = cli.pts {
        extract_pts(&cli, &mut e57, path)?;
    }

    Ok(())
}

/// Prints the header summary and every point set's prototype.
fn print_info(cli: &Cli, e57: &E57File<Vec<u8>>) {
    let header = e57.header();
    println!(
        "{}: E57 v{}.{}, {} bytes, page size {}",
        cli.file.display(),
        header.major,
        header.minor,
        header.file_physical_length,
        header.page_size
    );
    for (i, pts) in e57.points().iter().enumerate() {
        println!(
            "point set {}: {} records at {:#x}",
            i, pts.record_count, pts.file_offset
        );
        for comp in &pts.components {
            println!("  {}", describe_component(comp));
        }
    }
}

fn describe_component(comp: &Component) -> String {
    let role = comp.role.as_str();
    match comp.value {
        ComponentValue::Integer {
            min,
            max,
            bit_width,
        } => format!("{role}: Integer [{min}, {max}] ({bit_width} bits)"),
        ComponentValue::ScaledInteger {
            min,
            max,
            scale,
            offset,
            bit_width,
        } => format!(
            "{role}: ScaledInteger [{min}, {max}] scale={scale} offset={offset} ({bit_width} bits)"
        ),
        ComponentValue::Float { min, max } => format!("{role}: Float [{min}, {max}]"),
        ComponentValue::Double { min, max } => format!("{role}: Double [{min}, {max}]"),
    }
}

/// Extracts the embedded XML document to a file.
fn extract_xml(cli: &Cli, e57: &mut E57File<Vec<u8>>, path: &Path) -> Result<()> {
    let xml = e57
        .read_xml()
        .context("failed to extract the XML document")?;
    write_output(path, &xml, cli.force)?;
    info!("wrote {} bytes of XML", xml.len());
    println!("Wrote {}", path.display());
    Ok(())
}

/// Decodes the selected point set into an ASCII .pts file: a count
/// line, then one line per record with the selected components.
fn extract_pts(cli: &Cli, e57: &mut E57File<Vec<u8>>, path: &Path) -> Result<()> {
    if cli.batch == 0 {
        bail!("--batch must be positive");
    }
    if cli.components.is_empty() {
        bail!("--components must name at least one component");
    }
    let sets = e57.points();
    if cli.point_set >= sets.len() {
        bail!(
            "point set {} out of range: the file has {} point set(s)",
            cli.point_set,
            sets.len()
        );
    }
    let write_desc = resolve_components(&cli.components, &sets[cli.point_set])?;
    let record_count = sets[cli.point_set].record_count;

    if path.exists() && !cli.force {
        bail!(
            "file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    let file = fs::File::create(path)
        .with_context(|| format!("failed to create file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{record_count}")
        .with_context(|| format!("failed to write {}", path.display()))?;

    let lanes = cli.components.len();
    let mut buffer = vec![0f32; lanes * cli.batch];
    let mut io_error: Option<std::io::Error> = None;
    let mut written = 0u64;

    let result = e57.read_points(
        cli.point_set,
        &write_desc,
        &mut buffer,
        cli.batch,
        |values, count| {
            for record in values[..lanes * count].chunks_exact(lanes) {
                if let Err(e) = writeln!(writer, "{}", format_pts_line(record)) {
                    io_error = Some(e);
                    return false;
                }
            }
            written += count as u64;
            true
        },
    );

    if let Some(e) = io_error {
        return Err(e).with_context(|| format!("failed to write {}", path.display()));
    }
    result.with_context(|| format!("failed to decode point set {}", cli.point_set))?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;

    info!("decoded {} records", written);
    println!("Wrote {}", path.display());
    Ok(())
}

/// Maps the selected components to write descriptors: lane `i` of the
/// interleaved buffer holds component `i` of each record.
fn resolve_components(selected: &[PtsComponent], pts: &PointSet) -> Result<Vec<WriteDesc>> {
    let lanes = selected.len();
    selected
        .iter()
        .enumerate()
        .map(|(lane, &component)| {
            let role = component.role();
            let stream = pts
                .components
                .iter()
                .position(|c| c.role == role)
                .with_context(|| {
                    format!(
                        "component '{}' is not in the point set's prototype",
                        role.as_str()
                    )
                })?;
            Ok(WriteDesc {
                offset: lane,
                stride: lanes,
                stream,
            })
        })
        .collect()
}

fn format_pts_line(record: &[f32]) -> String {
    let mut line = String::new();
    for (i, value) in record.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&value.to_string());
    }
    line
}

/// Writes an output file, refusing to overwrite without --force.
fn write_output(path: &Path, content: &[u8], force: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
    }
    if path.exists() && !force {
        bail!(
            "file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    fs::write(path, content).with_context(|| format!("failed to write file: {}", path.display()))
}
