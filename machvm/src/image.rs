use super::{
    macho::{Header, Layout, HEADER_SIZE},
    BinaryImage, NotFound, ProcessInfo, Result, VirtualMemoryRead,
};

/// Finds executable images in a task and works out where they were loaded.
///
/// The main binary is the first readable region, in ascending address order,
/// that starts with a 64-bit Mach-O header whose filetype is `MH_EXECUTE`.
/// dyld (`MH_DYLINKER`), dylibs and bundles never match.
pub struct ImageLocator<'a, P> {
    proc: &'a P,
}

impl<'a, P> ImageLocator<'a, P>
where
    P: ProcessInfo + VirtualMemoryRead,
{
    pub const fn new(proc: &'a P) -> Self {
        Self { proc }
    }

    pub fn find_main_binary(&self) -> Result<u64> {
        for region in self.proc.get_maps() {
            let region = region?;
            if !region.protection.is_read() {
                continue;
            }
            match self.read_header(region.base) {
                Ok(Some(header)) if header.is_executable() => {
                    log::debug!("main binary of pid {} at {:#x}", self.proc.pid(), region.base);
                    return Ok(region.base);
                }
                _ => log::trace!("skip region {:#x}-{:#x}", region.base, region.end()),
            }
        }
        Err(NotFound::MainBinary(self.proc.pid()).into())
    }

    /// Parses the image whose header sits at `address`.
    pub fn image(&self, address: u64) -> Result<BinaryImage> {
        let mut buf = [0_u8; HEADER_SIZE];
        let len = self.proc.read_into(address, &mut buf)?.min(HEADER_SIZE);
        let header = Header::parse(&buf[..len])?;

        let commands = match header.sizeofcmds {
            0 => Vec::new(),
            n => self.proc.read_at(address.saturating_add(HEADER_SIZE as u64), n as u64)?,
        };
        let Layout { preferred_base, size } = Layout::parse(&header, &commands)?;
        log::debug!("image at {address:#x}: size {size:#x}, linked at {preferred_base:#x}");

        Ok(BinaryImage { base: address, size, preferred_base })
    }

    pub fn main_image(&self) -> Result<BinaryImage> {
        self.image(self.find_main_binary()?)
    }

    /// A header that does not parse is not an error here, just not an image.
    fn read_header(&self, address: u64) -> Result<Option<Header>> {
        let mut buf = [0_u8; HEADER_SIZE];
        let len = self.proc.read_into(address, &mut buf)?.min(HEADER_SIZE);
        Ok(Header::parse(&buf[..len]).ok())
    }
}

#[cfg(target_os = "macos")]
mod process {
    use super::{ImageLocator, Result};
    use crate::{Pid, Task};

    /// Address of the main executable's Mach-O header in process `pid`.
    pub fn find_main_binary(pid: Pid) -> Result<u64> {
        let task = Task::for_pid(pid)?;
        ImageLocator::new(&task).find_main_binary()
    }

    /// Mapped extent of the image whose header is at `address` in process `pid`.
    pub fn get_image_size(address: u64, pid: Pid) -> Result<u64> {
        let task = Task::for_pid(pid)?;
        Ok(ImageLocator::new(&task).image(address)?.size)
    }

    /// ASLR slide of the main executable of process `pid`.
    pub fn aslr_offset(pid: Pid) -> Result<i64> {
        let task = Task::for_pid(pid)?;
        Ok(ImageLocator::new(&task).main_image()?.slide())
    }
}

#[cfg(target_os = "macos")]
pub use process::{aslr_offset, find_main_binary, get_image_size};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kern::{KERN_INVALID_ADDRESS, KERN_NO_SPACE, KERN_PROTECTION_FAILURE},
        macho::{fixture, fixture::ImageBuilder, ParseError, CPU_TYPE_X86_64, MH_BUNDLE, MH_DYLIB, MH_DYLINKER},
        Error, KernelError, MemoryRegion, Pid, Protection,
    };

    struct FakeProcess {
        maps: Vec<(MemoryRegion, Vec<u8>)>,
        broken_after: Option<usize>,
    }

    impl FakeProcess {
        fn new() -> Self {
            Self { maps: Vec::new(), broken_after: None }
        }

        fn map(mut self, base: u64, size: u64, protection: Protection, data: Vec<u8>) -> Self {
            self.maps.push((MemoryRegion { base, size, protection, user_tag: 0 }, data));
            self
        }

        fn lookup(&self, address: u64, len: usize) -> Result<&[u8]> {
            let (region, data) = self
                .maps
                .iter()
                .find(|(r, _)| r.contains(address))
                .ok_or(KernelError::new(KERN_INVALID_ADDRESS))?;
            if !region.protection.is_read() {
                return Err(KernelError::new(KERN_PROTECTION_FAILURE).into());
            }
            let offset = (address - region.base) as usize;
            data.get(offset..offset + len).ok_or(KernelError::new(KERN_INVALID_ADDRESS).into())
        }
    }

    impl ProcessInfo for FakeProcess {
        fn pid(&self) -> Pid {
            4242
        }

        fn get_maps(&self) -> Box<dyn Iterator<Item = Result<MemoryRegion>> + '_> {
            let ok = self.maps.iter().map(|(r, _)| Ok(*r)).take(self.broken_after.unwrap_or(usize::MAX));
            let err: Option<Result<MemoryRegion>> =
                self.broken_after.map(|_| Err(KernelError::new(KERN_NO_SPACE).into()));
            Box::new(ok.chain(err))
        }
    }

    impl VirtualMemoryRead for FakeProcess {
        fn read_at(&self, address: u64, size: u64) -> Result<Vec<u8>> {
            Ok(self.lookup(address, size as usize)?.to_vec())
        }

        fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
            buf.copy_from_slice(self.lookup(address, buf.len())?);
            Ok(buf.len())
        }
    }

    const RX: Protection = Protection::from_bits(5);

    fn padded(mut image: Vec<u8>, len: usize) -> Vec<u8> {
        image.resize(len, 0);
        image
    }

    /// Typical layout: pagezero, main executable slid by 0x4000000, dyld, a dylib.
    fn process() -> FakeProcess {
        let exe = fixture::executable().build();
        let dyld = ImageBuilder::new(MH_DYLINKER).segment("__TEXT", 0x0, 0x1000, 0, 0x1000).build();
        let dylib = ImageBuilder::new(MH_DYLIB).segment("__TEXT", 0x0, 0x2000, 0, 0x2000).build();
        FakeProcess::new()
            .map(0x0, 0x1_0000_0000, Protection::NONE, Vec::new())
            .map(0x1_0000_0000, 0x400_0000, Protection::DEFAULT, vec![0; 0x1000])
            .map(0x1_0400_0000, 0x4000, RX, padded(exe, 0x4000))
            .map(0x1_0400_4000, 0xc000, Protection::READ, vec![0; 0xc000])
            .map(0x1_8000_0000, 0x1000, RX, padded(dylib, 0x1000))
            .map(0x1_9000_0000, 0x1000, RX, padded(dyld, 0x1000))
    }

    #[test]
    fn test_find_main_binary() {
        let proc = process();
        let locator = ImageLocator::new(&proc);
        assert_eq!(locator.find_main_binary().unwrap(), 0x1_0400_0000);
    }

    #[test]
    fn test_main_image_slide() {
        let proc = process();
        let image = ImageLocator::new(&proc).main_image().unwrap();
        assert_eq!(image, BinaryImage { base: 0x1_0400_0000, size: 0x10000, preferred_base: 0x1_0000_0000 });
        assert_eq!(image.slide(), 0x400_0000);
    }

    #[test]
    fn test_slide_is_stable() {
        let proc = process();
        let locator = ImageLocator::new(&proc);
        let first = locator.main_image().unwrap().slide();
        let second = locator.main_image().unwrap().slide();
        assert_eq!(first, second);
    }

    #[test]
    fn test_skips_libraries_and_unreadable_regions() {
        let exe = fixture::executable().build();
        let dylib = ImageBuilder::new(MH_DYLIB).segment("__TEXT", 0x0, 0x2000, 0, 0x2000).build();
        let bundle = ImageBuilder::new(MH_BUNDLE).segment("__TEXT", 0x0, 0x1000, 0, 0x1000).build();
        let proc = FakeProcess::new()
            .map(0x1000, 0x1000, Protection::NONE, padded(exe.clone(), 0x1000))
            .map(0x2000, 0x1000, RX, padded(dylib, 0x1000))
            .map(0x3000, 0x10, Protection::READ, vec![0; 0x10])
            .map(0x4000, 0x1000, RX, padded(bundle, 0x1000))
            .map(0x5000, 0x1000, RX, padded(exe, 0x1000));
        assert_eq!(ImageLocator::new(&proc).find_main_binary().unwrap(), 0x5000);
    }

    #[test]
    fn test_main_binary_not_found() {
        let proc = FakeProcess::new().map(0x1000, 0x1000, Protection::DEFAULT, vec![0; 0x1000]);
        let err = ImageLocator::new(&proc).find_main_binary().unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFound::MainBinary(4242))));
    }

    #[test]
    fn test_region_enumeration_failure() {
        let mut proc = FakeProcess::new().map(0x1000, 0x1000, Protection::DEFAULT, vec![0; 0x1000]);
        proc.broken_after = Some(1);
        let err = ImageLocator::new(&proc).find_main_binary().unwrap_err();
        assert_eq!(err.kern_return(), Some(KERN_NO_SPACE));
    }

    #[test]
    fn test_image_malformed_header() {
        let mut builder = fixture::executable();
        builder.cputype = 0x12;
        let proc = FakeProcess::new().map(0x1000, 0x1000, RX, padded(builder.build(), 0x1000));
        let err = ImageLocator::new(&proc).image(0x1000).unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::UnsupportedCpu(0x12))));

        let proc = FakeProcess::new().map(0x1000, 0x1000, RX, vec![0xAB; 0x1000]);
        let err = ImageLocator::new(&proc).image(0x1000).unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::BadMagic(_))));
    }

    #[test]
    fn test_image_without_commands() {
        let mut builder = ImageBuilder::new(0x2);
        builder.cputype = CPU_TYPE_X86_64;
        let proc = FakeProcess::new().map(0x1000, 0x1000, RX, padded(builder.build(), 0x1000));
        let err = ImageLocator::new(&proc).image(0x1000).unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::NoSegments)));
    }

    #[test]
    fn test_image_read_failure() {
        let exe = fixture::executable().build();
        let header_only = exe[..HEADER_SIZE].to_vec();
        let proc = FakeProcess::new().map(0x1000, 0x1000, RX, header_only);
        let err = ImageLocator::new(&proc).image(0x1000).unwrap_err();
        assert_eq!(err.kern_return(), Some(KERN_INVALID_ADDRESS));

        let err = ImageLocator::new(&proc).image(0x9000).unwrap_err();
        assert_eq!(err.kern_return(), Some(KERN_INVALID_ADDRESS));
    }
}
