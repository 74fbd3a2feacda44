//! Just enough Mach-O to find where an image starts, how far it extends, and
//! the address it was linked at.
//!
//! Everything here works on byte slices copied out of the target task, so it
//! is independent of the host platform.

use thiserror::Error;

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;

pub const CPU_TYPE_X86_64: i32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: i32 = 0x0100_000c;

pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_DYLINKER: u32 = 0x7;
pub const MH_BUNDLE: u32 = 0x8;

pub const LC_SEGMENT_64: u32 = 0x19;

pub const SEG_PAGEZERO: &[u8] = b"__PAGEZERO";
pub const SEG_TEXT: &[u8] = b"__TEXT";

/// `sizeof(struct mach_header_64)`
pub const HEADER_SIZE: usize = 32;
/// `sizeof(struct load_command)`
const LOAD_COMMAND_SIZE: usize = 8;
/// `sizeof(struct segment_command_64)`
const SEGMENT_COMMAND_64_SIZE: usize = 72;

/// Upper bound on `sizeofcmds`; anything larger is not a header we want to trust.
pub const MAX_COMMANDS_SIZE: u32 = 16 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("truncated mach-o data: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("bad mach-o magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported mach-o format, magic {0:#010x}")]
    UnsupportedFormat(u32),
    #[error("unsupported cpu type {0:#x}")]
    UnsupportedCpu(i32),
    #[error("load commands size {sizeofcmds} cannot hold {ncmds} commands")]
    CommandsSize { ncmds: u32, sizeofcmds: u32 },
    #[error("load commands size {0} exceeds limit")]
    CommandsTooLarge(u32),
    #[error("load command #{index} has invalid size {cmdsize}")]
    BadCommandSize { index: u32, cmdsize: u32 },
    #[error("load command #{index} runs past the end of the load commands")]
    CommandOverrun { index: u32 },
    #[error("segment command #{index} is too small ({cmdsize} bytes)")]
    SegmentTooSmall { index: u32, cmdsize: u32 },
    #[error("segment command #{index} has out of range bounds")]
    SegmentOverflow { index: u32 },
    #[error("image has no mapped segments")]
    NoSegments,
    #[error("image has no __TEXT segment")]
    NoTextSegment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

impl Header {
    /// Parses and validates a `mach_header_64`.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < HEADER_SIZE {
            return Err(ParseError::Truncated { needed: HEADER_SIZE, got: buf.len() });
        }
        let magic = u32_at(buf, 0);
        match magic {
            MH_MAGIC_64 => {}
            MH_CIGAM_64 | MH_MAGIC | MH_CIGAM | FAT_MAGIC | FAT_CIGAM => {
                return Err(ParseError::UnsupportedFormat(magic))
            }
            _ => return Err(ParseError::BadMagic(magic)),
        }

        let header = Self {
            cputype: u32_at(buf, 4) as i32,
            cpusubtype: u32_at(buf, 8) as i32,
            filetype: u32_at(buf, 12),
            ncmds: u32_at(buf, 16),
            sizeofcmds: u32_at(buf, 20),
            flags: u32_at(buf, 24),
        };

        if !matches!(header.cputype, CPU_TYPE_X86_64 | CPU_TYPE_ARM64) {
            return Err(ParseError::UnsupportedCpu(header.cputype));
        }
        if header.sizeofcmds > MAX_COMMANDS_SIZE {
            return Err(ParseError::CommandsTooLarge(header.sizeofcmds));
        }
        if (header.ncmds as u64) * (LOAD_COMMAND_SIZE as u64) > header.sizeofcmds as u64 {
            return Err(ParseError::CommandsSize { ncmds: header.ncmds, sizeofcmds: header.sizeofcmds });
        }
        Ok(header)
    }

    pub const fn is_executable(&self) -> bool {
        self.filetype == MH_EXECUTE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: i32,
    pub initprot: i32,
}

impl Segment {
    pub fn name(&self) -> &[u8] {
        let len = self.segname.iter().position(|&b| b == 0).unwrap_or(self.segname.len());
        &self.segname[..len]
    }

    pub fn is_pagezero(&self) -> bool {
        self.name() == SEG_PAGEZERO
    }
}

/// Iterates the `LC_SEGMENT_64` commands in `commands`, validating every load
/// command on the way.
pub fn segments(header: &Header, commands: &[u8]) -> Result<Vec<Segment>, ParseError> {
    let sizeofcmds = header.sizeofcmds as usize;
    if commands.len() < sizeofcmds {
        return Err(ParseError::Truncated { needed: sizeofcmds, got: commands.len() });
    }
    let commands = &commands[..sizeofcmds];

    let mut segments = Vec::new();
    let mut offset = 0_usize;
    for index in 0..header.ncmds {
        if offset + LOAD_COMMAND_SIZE > commands.len() {
            return Err(ParseError::CommandOverrun { index });
        }
        let cmd = u32_at(commands, offset);
        let cmdsize = u32_at(commands, offset + 4);
        if (cmdsize as usize) < LOAD_COMMAND_SIZE || cmdsize % 8 != 0 {
            return Err(ParseError::BadCommandSize { index, cmdsize });
        }
        let end = offset + cmdsize as usize;
        if end > commands.len() {
            return Err(ParseError::CommandOverrun { index });
        }

        if cmd == LC_SEGMENT_64 {
            if (cmdsize as usize) < SEGMENT_COMMAND_64_SIZE {
                return Err(ParseError::SegmentTooSmall { index, cmdsize });
            }
            let raw = &commands[offset..end];
            let mut segname = [0_u8; 16];
            segname.copy_from_slice(&raw[8..24]);
            let segment = Segment {
                segname,
                vmaddr: u64_at(raw, 24),
                vmsize: u64_at(raw, 32),
                fileoff: u64_at(raw, 40),
                filesize: u64_at(raw, 48),
                maxprot: u32_at(raw, 56) as i32,
                initprot: u32_at(raw, 60) as i32,
            };
            if segment.vmaddr.checked_add(segment.vmsize).is_none() {
                return Err(ParseError::SegmentOverflow { index });
            }
            segments.push(segment);
        }
        offset = end;
    }
    Ok(segments)
}

/// The link-time address range an image occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// `vmaddr` of the `__TEXT` segment, where the header lives.
    pub preferred_base: u64,
    /// Distance from the lowest mapped segment start to the highest segment end.
    pub size: u64,
}

impl Layout {
    pub fn parse(header: &Header, commands: &[u8]) -> Result<Self, ParseError> {
        let segments = segments(header, commands)?;
        Self::from_segments(&segments)
    }

    /// `__PAGEZERO` and zero-sized segments reserve address space but map
    /// nothing, so they do not count toward the extent.
    pub fn from_segments(segments: &[Segment]) -> Result<Self, ParseError> {
        let (start, end) = segments
            .iter()
            .filter(|s| s.vmsize != 0 && !s.is_pagezero())
            .fold((u64::MAX, 0_u64), |(start, end), s| (start.min(s.vmaddr), end.max(s.vmaddr + s.vmsize)));
        if start >= end {
            return Err(ParseError::NoSegments);
        }

        let text = segments
            .iter()
            .find(|s| s.name() == SEG_TEXT)
            .or_else(|| segments.iter().find(|s| s.fileoff == 0 && s.filesize != 0))
            .ok_or(ParseError::NoTextSegment)?;

        Ok(Self { preferred_base: text.vmaddr, size: end - start })
    }
}

// Callers check bounds first.
#[inline]
fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0_u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

#[inline]
fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut word = [0_u8; 8];
    word.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(word)
}


#[cfg(test)]
fn parse_image(buf: &[u8]) -> Result<(Header, Layout), ParseError> {
    let header = Header::parse(buf)?;
    let layout = Layout::parse(&header, &buf[HEADER_SIZE..])?;
    Ok((header, layout))
}

#[test]
fn test_executable_layout() {
    let buf = fixture::executable().build();
    let (header, layout) = parse_image(&buf).unwrap();
    assert!(header.is_executable());
    assert_eq!(header.ncmds, 5);
    assert_eq!(layout.preferred_base, 0x1_0000_0000);
    assert_eq!(layout.size, 0x10000);
}

#[test]
fn test_dylib_without_pagezero() {
    let buf = ImageBuilder::new(MH_DYLIB)
        .segment("__TEXT", 0, 0x8000, 0, 0x8000)
        .segment("__DATA", 0x8000, 0x1000, 0x8000, 0x1000)
        .build();
    let (header, layout) = parse_image(&buf).unwrap();
    assert!(!header.is_executable());
    assert_eq!(layout.preferred_base, 0);
    assert_eq!(layout.size, 0x9000);
}

#[test]
fn test_text_fallback_to_first_file_mapped_segment() {
    let buf = ImageBuilder::new(MH_EXECUTE)
        .segment("__PAGEZERO", 0, 0x1000, 0, 0)
        .segment("__CODE", 0x2000, 0x1000, 0, 0x1000)
        .build();
    let (_, layout) = parse_image(&buf).unwrap();
    assert_eq!(layout.preferred_base, 0x2000);
    assert_eq!(layout.size, 0x1000);
}

#[test]
fn test_segment_name() {
    let buf = fixture::executable().build();
    let header = Header::parse(&buf).unwrap();
    let segs = segments(&header, &buf[HEADER_SIZE..]).unwrap();
    let names: Vec<_> = segs.iter().map(|s| s.name()).collect();
    let expected: [&[u8]; 4] = [b"__PAGEZERO", b"__TEXT", b"__DATA_CONST", b"__LINKEDIT"];
    assert_eq!(names, expected);
    assert!(segs[0].is_pagezero());
}

#[test]
fn test_reject_bad_magic() {
    let mut buf = fixture::executable().build();
    buf[..4].copy_from_slice(&0xdead_beef_u32.to_le_bytes());
    assert_eq!(Header::parse(&buf), Err(ParseError::BadMagic(0xdead_beef)));

    for magic in [MH_MAGIC, MH_CIGAM_64, FAT_MAGIC] {
        buf[..4].copy_from_slice(&magic.to_le_bytes());
        assert_eq!(Header::parse(&buf), Err(ParseError::UnsupportedFormat(magic)));
    }
}

#[test]
fn test_reject_truncated_header() {
    let buf = fixture::executable().build();
    assert_eq!(Header::parse(&buf[..16]), Err(ParseError::Truncated { needed: HEADER_SIZE, got: 16 }));
    assert_eq!(Header::parse(&[]), Err(ParseError::Truncated { needed: HEADER_SIZE, got: 0 }));
}

#[test]
fn test_reject_unsupported_cpu() {
    let mut builder = fixture::executable();
    builder.cputype = 0x12; // CPU_TYPE_POWERPC
    assert_eq!(Header::parse(&builder.build()), Err(ParseError::UnsupportedCpu(0x12)));
}

#[test]
fn test_reject_inconsistent_command_sizes() {
    let mut buf = fixture::executable().build();
    buf[16..20].copy_from_slice(&1000_u32.to_le_bytes());
    assert!(matches!(Header::parse(&buf), Err(ParseError::CommandsSize { ncmds: 1000, .. })));

    let mut buf = fixture::executable().build();
    buf[20..24].copy_from_slice(&(MAX_COMMANDS_SIZE + 8).to_le_bytes());
    assert_eq!(Header::parse(&buf), Err(ParseError::CommandsTooLarge(MAX_COMMANDS_SIZE + 8)));
}

#[test]
fn test_reject_truncated_commands() {
    let buf = fixture::executable().build();
    let header = Header::parse(&buf).unwrap();
    let short = &buf[HEADER_SIZE..buf.len() - 8];
    assert!(matches!(Layout::parse(&header, short), Err(ParseError::Truncated { .. })));
}

#[test]
fn test_reject_bad_command() {
    let buf = ImageBuilder::new(MH_EXECUTE).command(0x2, 4, 0).build();
    assert_eq!(parse_image(&buf), Err(ParseError::BadCommandSize { index: 0, cmdsize: 4 }));

    let buf = ImageBuilder::new(MH_EXECUTE).command(0x2, 12, 4).build();
    assert_eq!(parse_image(&buf), Err(ParseError::BadCommandSize { index: 0, cmdsize: 12 }));

    let buf = ImageBuilder::new(MH_EXECUTE).command(0x2, 64, 8).build();
    assert_eq!(parse_image(&buf), Err(ParseError::CommandOverrun { index: 0 }));

    let buf = ImageBuilder::new(MH_EXECUTE).command(LC_SEGMENT_64, 16, 8).build();
    assert_eq!(parse_image(&buf), Err(ParseError::SegmentTooSmall { index: 0, cmdsize: 16 }));
}

#[test]
fn test_reject_segment_overflow() {
    let buf = ImageBuilder::new(MH_EXECUTE).segment("__TEXT", u64::MAX - 0x10, 0x1000, 0, 0x1000).build();
    assert_eq!(parse_image(&buf), Err(ParseError::SegmentOverflow { index: 0 }));
}

#[test]
fn test_reject_no_segments() {
    let buf = ImageBuilder::new(MH_EXECUTE).command(0x2, 24, 16).build();
    assert_eq!(parse_image(&buf), Err(ParseError::NoSegments));

    let buf = ImageBuilder::new(MH_EXECUTE).segment("__PAGEZERO", 0, 0x1000, 0, 0).build();
    assert_eq!(parse_image(&buf), Err(ParseError::NoSegments));
}

#[test]
fn test_reject_no_text() {
    let buf = ImageBuilder::new(MH_EXECUTE).segment("__DATA", 0x4000, 0x1000, 0x4000, 0x1000).build();
    assert_eq!(parse_image(&buf), Err(ParseError::NoTextSegment));
}

#[cfg(test)]
use fixture::ImageBuilder;
