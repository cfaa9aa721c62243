//! Fast-start reordering for progressive playback of ISO media files.
//!
//! Files written with the `moov` index after the media data cannot start
//! playing until the whole file is present. [`FastStartReader`] presents
//! such a file with `moov` moved directly after `ftyp` and its chunk offset
//! tables patched, without copying the media data. Reads and seeks use
//! logical (reordered) offsets and are translated to physical file offsets.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, trace};

/// File extensions served through the reorder adapter.
pub const FAST_START_EXTENSIONS: &[&str] = &["mp4", "m4v", "m4a", "mov", "qt", "3gp", "3g2"];

/// Upper bound on an index atom held in memory for patching.
const MAX_MOOV_SIZE: u64 = 64 * 1024 * 1024;

/// Atoms whose children may contain chunk offset tables.
const CONTAINER_ATOMS: &[&[u8; 4]] = &[b"moov", b"trak", b"mdia", b"minf", b"stbl"];

/// Whether `path` has an extension eligible for fast-start reordering.
pub fn supports_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            FAST_START_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

#[derive(Debug, Clone, Copy)]
struct Atom {
    kind: [u8; 4],
    start: u64,
    size: u64,
}

impl Atom {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// One contiguous run of the logical stream.
#[derive(Debug)]
enum Segment {
    Physical {
        logical_start: u64,
        physical_start: u64,
        len: u64,
    },
    Memory {
        logical_start: u64,
        data: Vec<u8>,
    },
}

impl Segment {
    fn logical_start(&self) -> u64 {
        match self {
            Segment::Physical { logical_start, .. } | Segment::Memory { logical_start, .. } => {
                *logical_start
            }
        }
    }

    fn len(&self) -> u64 {
        match self {
            Segment::Physical { len, .. } => *len,
            Segment::Memory { data, .. } => data.len() as u64,
        }
    }
}

/// Reader that serves an ISO media file in fast-start order.
///
/// Files that are already fast-start, or that cannot be reordered safely
/// (compressed index, offsets that would overflow, unparseable atoms), are
/// passed through unchanged.
#[derive(Debug)]
pub struct FastStartReader<R> {
    inner: R,
    segments: Vec<Segment>,
    length: u64,
    position: u64,
}

impl<R: Read + Seek> FastStartReader<R> {
    /// Scans the top-level atoms of `inner` and builds the logical layout.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - If the underlying reader fails while scanning
    pub fn new(mut inner: R) -> io::Result<Self> {
        let length = inner.seek(SeekFrom::End(0))?;
        let segments = match plan_reorder(&mut inner, length)? {
            Some(segments) => segments,
            None => vec![Segment::Physical {
                logical_start: 0,
                physical_start: 0,
                len: length,
            }],
        };
        inner.seek(SeekFrom::Start(0))?;

        Ok(Self {
            inner,
            segments,
            length,
            position: 0,
        })
    }

    /// Logical length, equal to the physical file length.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether the file is being served in a different order than stored.
    pub fn is_reordered(&self) -> bool {
        self.segments.len() > 1
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for FastStartReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.length {
            return Ok(0);
        }
        let position = self.position;
        let Some(segment) = self
            .segments
            .iter()
            .find(|segment| position < segment.logical_start() + segment.len())
        else {
            return Ok(0);
        };

        let within = position - segment.logical_start();
        let available = (segment.len() - within).min(buf.len() as u64) as usize;
        let read = match segment {
            Segment::Memory { data, .. } => {
                let start = within as usize;
                buf[..available].copy_from_slice(&data[start..start + available]);
                available
            }
            Segment::Physical { physical_start, .. } => {
                self.inner.seek(SeekFrom::Start(physical_start + within))?;
                self.inner.read(&mut buf[..available])?
            }
        };

        self.position += read as u64;
        Ok(read)
    }
}

impl<R: Read + Seek> Seek for FastStartReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ));
        };
        self.position = target;
        Ok(target)
    }
}

/// Computes the reordered layout, or `None` if the file should pass through.
fn plan_reorder<R: Read + Seek>(reader: &mut R, length: u64) -> io::Result<Option<Vec<Segment>>> {
    let Some(atoms) = scan_top_level(reader, length)? else {
        return Ok(None);
    };

    let Some(ftyp) = atoms.first().filter(|atom| &atom.kind == b"ftyp") else {
        return Ok(None);
    };
    let Some(mdat_index) = atoms.iter().position(|atom| &atom.kind == b"mdat") else {
        return Ok(None);
    };
    let Some(moov_index) = atoms.iter().position(|atom| &atom.kind == b"moov") else {
        return Ok(None);
    };
    if moov_index < mdat_index {
        return Ok(None);
    }

    let moov = atoms[moov_index];
    if moov.size > MAX_MOOV_SIZE {
        debug!("Index atom of {} bytes too large to reorder", moov.size);
        return Ok(None);
    }

    let mut data = vec![0u8; moov.size as usize];
    reader.seek(SeekFrom::Start(moov.start))?;
    reader.read_exact(&mut data)?;

    let shift = OffsetShift {
        from: ftyp.end(),
        until: moov.start,
        delta: moov.size,
    };
    let body = header_len(&data)?;
    if let Err(reason) = patch_container(&mut data, body, &shift) {
        debug!("Serving file unchanged: {}", reason);
        return Ok(None);
    }

    trace!(
        moov_start = moov.start,
        moov_size = moov.size,
        "Reordering index atom to front"
    );
    let moved_len = moov.start - ftyp.end();
    Ok(Some(vec![
        Segment::Physical {
            logical_start: 0,
            physical_start: 0,
            len: ftyp.end(),
        },
        Segment::Memory {
            logical_start: ftyp.end(),
            data,
        },
        Segment::Physical {
            logical_start: ftyp.end() + moov.size,
            physical_start: ftyp.end(),
            len: moved_len,
        },
        Segment::Physical {
            logical_start: moov.end(),
            physical_start: moov.end(),
            len: length - moov.end(),
        },
    ]))
}

/// Lists top-level atoms, or `None` if the layout is not a well-formed
/// sequence of atoms.
fn scan_top_level<R: Read + Seek>(reader: &mut R, length: u64) -> io::Result<Option<Vec<Atom>>> {
    let mut atoms = Vec::new();
    let mut position = 0;

    while position < length {
        if length - position < 8 {
            return Ok(None);
        }
        reader.seek(SeekFrom::Start(position))?;
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;

        let mut size = u64::from(u32::from_be_bytes([header[0], header[1], header[2], header[3]]));
        let kind = [header[4], header[5], header[6], header[7]];
        let mut header_len = 8;
        if size == 1 {
            let mut large = [0u8; 8];
            reader.read_exact(&mut large)?;
            size = u64::from_be_bytes(large);
            header_len = 16;
        } else if size == 0 {
            size = length - position;
        }

        if size < header_len || size > length - position {
            return Ok(None);
        }
        atoms.push(Atom {
            kind,
            start: position,
            size,
        });
        position += size;
    }

    Ok(Some(atoms))
}

/// Chunk offsets in `from..until` move forward by `delta`.
struct OffsetShift {
    from: u64,
    until: u64,
    delta: u64,
}

impl OffsetShift {
    fn apply(&self, offset: u64) -> u64 {
        if (self.from..self.until).contains(&offset) {
            offset + self.delta
        } else {
            offset
        }
    }
}

fn header_len(atom: &[u8]) -> io::Result<usize> {
    match atom.get(..4) {
        Some([0, 0, 0, 1]) => Ok(16),
        Some(_) => Ok(8),
        None => Err(io::Error::new(io::ErrorKind::InvalidData, "truncated atom")),
    }
}

/// Walks the children of the container `atom` starting at `body`, patching
/// every chunk offset table found.
fn patch_container(atom: &mut [u8], body: usize, shift: &OffsetShift) -> Result<(), &'static str> {
    let mut position = body;
    while position < atom.len() {
        let remaining = atom.len() - position;
        if remaining < 8 {
            return Err("truncated child atom");
        }
        let size = u32::from_be_bytes(read_array(atom, position)?) as usize;
        let kind: [u8; 4] = read_array(atom, position + 4)?;
        let (size, header) = match size {
            0 => (remaining, 8),
            1 => {
                let large = u64::from_be_bytes(read_array(atom, position + 8)?);
                (usize::try_from(large).map_err(|_| "child atom too large")?, 16)
            }
            size => (size, 8),
        };
        if size < header || size > remaining {
            return Err("malformed child atom");
        }

        let child = &mut atom[position..position + size];
        match &kind {
            b"cmov" => return Err("compressed index atom"),
            b"stco" => patch_offsets::<4>(&mut child[header..], shift)?,
            b"co64" => patch_offsets::<8>(&mut child[header..], shift)?,
            kind if CONTAINER_ATOMS.contains(&kind) => patch_container(child, header, shift)?,
            _ => {}
        }
        position += size;
    }
    Ok(())
}

/// Patches a `stco` (`WIDTH` 4) or `co64` (`WIDTH` 8) table body.
fn patch_offsets<const WIDTH: usize>(table: &mut [u8], shift: &OffsetShift) -> Result<(), &'static str> {
    let count = u32::from_be_bytes(read_array(table, 4)?) as usize;
    let entries = table.get_mut(8..).ok_or("truncated offset table")?;
    if entries.len() < count * WIDTH {
        return Err("truncated offset table");
    }

    for entry in entries.chunks_exact_mut(WIDTH).take(count) {
        if WIDTH == 4 {
            let offset = u64::from(u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]));
            let patched = u32::try_from(shift.apply(offset)).map_err(|_| "32-bit chunk offset overflow")?;
            entry.copy_from_slice(&patched.to_be_bytes());
        } else {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(entry);
            let patched = shift.apply(u64::from_be_bytes(raw));
            entry.copy_from_slice(&patched.to_be_bytes());
        }
    }
    Ok(())
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> Result<[u8; N], &'static str> {
    data.get(at..at + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or("truncated atom header")
}
