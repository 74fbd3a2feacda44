use std::io::{self, Write};

use machvm::{MemoryRegion, Protection};

use super::error::Result;

/// Splits `[address, address + size)` along region boundaries, pairing each
/// piece with the protection its region has now. Fails if any byte of the
/// range is unmapped.
pub fn protection_spans<I>(regions: I, address: u64, size: u64) -> Result<Vec<(u64, u64, Protection)>>
where
    I: IntoIterator<Item = machvm::Result<MemoryRegion>>,
{
    let end = address.checked_add(size).ok_or("address range overflows")?;
    let mut spans = Vec::new();
    let mut cursor = address;
    for region in regions {
        if cursor == end {
            break;
        }
        let region = region?;
        if region.end() <= cursor {
            continue;
        }
        if region.base > cursor {
            break;
        }
        let stop = region.end().min(end);
        spans.push((cursor, stop - cursor, region.protection));
        cursor = stop;
    }
    if cursor != end {
        return Err(format!("{cursor:#x} is not mapped").into());
    }
    Ok(spans)
}

/// Classic 16-bytes-per-line dump, addresses relative to `base`.
pub fn hexdump<W: Write>(mut w: W, base: u64, bytes: &[u8]) -> io::Result<()> {
    for (i, line) in bytes.chunks(16).enumerate() {
        write!(w, "{:016x}  ", base + (i * 16) as u64)?;
        for col in 0..16 {
            match line.get(col) {
                Some(b) => write!(w, "{b:02x} ")?,
                None => write!(w, "   ")?,
            }
            if col == 7 {
                write!(w, " ")?;
            }
        }
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        writeln!(w, " |{ascii}|")?;
    }
    Ok(())
}

#[test]
fn test_hexdump() {
    let mut out = Vec::new();
    hexdump(&mut out, 0x1000, b"hello, mach\x00\x01").unwrap();
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "0000000000001000  68 65 6c 6c 6f 2c 20 6d  61 63 68 00 01           |hello, mach..|\n"
    );
}

#[cfg(test)]
fn region(base: u64, size: u64, protection: Protection) -> machvm::Result<MemoryRegion> {
    Ok(MemoryRegion { base, size, protection, user_tag: 0 })
}

#[test]
fn test_protection_spans_cross_regions() {
    let rx = Protection::READ | Protection::EXECUTE;
    let regions = vec![
        region(0x0, 0x1000, Protection::NONE),
        region(0x1000, 0x1000, rx),
        region(0x2000, 0x1000, Protection::DEFAULT),
        region(0x3000, 0x1000, Protection::READ),
    ];
    let spans = protection_spans(regions, 0x1ff0, 0x20).unwrap();
    assert_eq!(spans, [(0x1ff0, 0x10, rx), (0x2000, 0x10, Protection::DEFAULT)]);
}

#[test]
fn test_protection_spans_single_region() {
    let regions = vec![region(0x1000, 0x1000, Protection::READ), region(0x2000, 0x1000, Protection::DEFAULT)];
    let spans = protection_spans(regions, 0x1100, 0x10).unwrap();
    assert_eq!(spans, [(0x1100, 0x10, Protection::READ)]);
}

#[test]
fn test_protection_spans_unmapped() {
    let regions = vec![region(0x1000, 0x1000, Protection::READ), region(0x3000, 0x1000, Protection::READ)];
    let err = protection_spans(regions, 0x1ff0, 0x20).unwrap_err();
    assert_eq!(err.0, "0x2000 is not mapped");

    let regions = vec![region(0x1000, 0x1000, Protection::READ)];
    assert!(protection_spans(regions, 0x8000, 0x10).is_err());
}

#[test]
fn test_protection_spans_enumeration_error() {
    let regions = vec![
        region(0x1000, 0x1000, Protection::READ),
        Err(machvm::KernelError::new(machvm::kern::KERN_NO_SPACE).into()),
    ];
    let err = protection_spans(regions, 0x1ff0, 0x20).unwrap_err();
    assert_eq!(err.0, machvm::Error::from(machvm::KernelError::new(machvm::kern::KERN_NO_SPACE)).to_string());
}
