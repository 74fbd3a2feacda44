#[cfg(all(target_os = "macos", target_pointer_width = "32"))]
compile_error!("32-bit macos is not supported.");

mod error;
mod image;
pub mod kern;
pub mod macho;
mod prot;

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod memory;
        mod task;

        pub use self::image::{aslr_offset, find_main_binary, get_image_size};
        pub use self::memory::{protect, read, read_into, write, RegionIter};
        pub use self::task::Task;
    }
}

pub use self::{
    error::{Error, KernelError, NotFound, Result},
    image::ImageLocator,
    macho::ParseError,
    prot::Protection,
};

pub type Pid = i32;

/// A contiguous range of a task's address space and its current protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
    pub protection: Protection,
    pub user_tag: u32,
}

impl MemoryRegion {
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub const fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Where an executable image sits in a task, and where it was linked to sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryImage {
    pub base: u64,
    pub size: u64,
    pub preferred_base: u64,
}

impl BinaryImage {
    /// ASLR slide: actual load address minus link-time preferred address.
    pub const fn slide(&self) -> i64 {
        self.base.wrapping_sub(self.preferred_base) as i64
    }

    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

pub trait VirtualMemoryRead {
    /// Copies `size` bytes at `address` into a new buffer owned by the caller.
    fn read_at(&self, address: u64, size: u64) -> Result<Vec<u8>>;

    /// Reads into `buf`, returning how many bytes the kernel copied.
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<usize>;
}

pub trait VirtualMemoryWrite {
    fn write_at(&self, address: u64, data: &[u8]) -> Result<()>;
}

pub trait VirtualMemoryProtect {
    fn protect(&self, address: u64, size: u64, protection: Protection) -> Result<()>;
}

pub trait ProcessInfo {
    fn pid(&self) -> Pid;

    /// Mapped regions in ascending address order. An enumeration failure is
    /// yielded once and ends the iterator.
    fn get_maps(&self) -> Box<dyn Iterator<Item = Result<MemoryRegion>> + '_>;
}

#[test]
fn test_binary_image_slide() {
    let image = BinaryImage { base: 0x1_0400_0000, size: 0x8000, preferred_base: 0x1_0000_0000 };
    assert_eq!(image.slide(), 0x400_0000);
    assert_eq!(image.end(), 0x1_0400_8000);

    let below = BinaryImage { base: 0x1000, size: 0x1000, preferred_base: 0x2000 };
    assert_eq!(below.slide(), -0x1000);
}

#[test]
fn test_memory_region_contains() {
    let region = MemoryRegion { base: 0x4000, size: 0x4000, protection: Protection::DEFAULT, user_tag: 0 };
    assert!(region.contains(0x4000));
    assert!(region.contains(0x7fff));
    assert!(!region.contains(0x8000));
    assert!(!region.contains(0x3fff));
}
