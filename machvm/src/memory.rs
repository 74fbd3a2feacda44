use core::{mem, slice};

use machx::{
    message::mach_msg_type_number_t,
    port::mach_port_t,
    traps::mach_task_self,
    vm::{mach_vm_deallocate, mach_vm_protect, mach_vm_read, mach_vm_read_overwrite, mach_vm_region, mach_vm_write},
    vm_region::{vm_region_extended_info, vm_region_extended_info_data_t, vm_region_info_t, VM_REGION_EXTENDED_INFO},
    vm_types::{mach_vm_address_t, mach_vm_size_t, vm_offset_t},
};

use super::{
    kern::{KERN_INVALID_ADDRESS, KERN_INVALID_ARGUMENT, KERN_SUCCESS},
    KernelError, MemoryRegion, Protection, Result, Task, VirtualMemoryProtect, VirtualMemoryRead, VirtualMemoryWrite,
};

/// Changes the current protection of `[address, address + size)`. The
/// maximum protection is left alone.
pub fn protect(task: &Task, address: u64, size: u64, protection: Protection) -> Result<()> {
    if size == 0 {
        return Err(KernelError::new(KERN_INVALID_ARGUMENT).into());
    }
    let kr = unsafe { mach_vm_protect(task.port(), address, size, 0, protection.bits()) };
    Ok(KernelError::check(kr)?)
}

/// Copies `size` bytes out of the task. The kernel's out-of-line buffer is
/// released before returning, on every path.
pub fn read(task: &Task, address: u64, size: u64) -> Result<Vec<u8>> {
    if size == 0 {
        return Err(KernelError::new(KERN_INVALID_ARGUMENT).into());
    }
    let mut data: vm_offset_t = 0;
    let mut count: mach_msg_type_number_t = 0;
    let kr = unsafe { mach_vm_read(task.port(), address, size, &mut data, &mut count) };
    KernelError::check(kr)?;

    let buffer = KernelBuffer { address: data as _, size: count as _ };
    Ok(buffer.as_slice().to_vec())
}

/// Reads into a caller-owned buffer, returning the number of bytes copied.
pub fn read_into(task: &Task, address: u64, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Err(KernelError::new(KERN_INVALID_ARGUMENT).into());
    }
    let mut out: mach_vm_size_t = 0;
    let kr = unsafe {
        mach_vm_read_overwrite(task.port(), address, buf.len() as _, buf.as_mut_ptr() as mach_vm_address_t, &mut out)
    };
    KernelError::check(kr)?;
    Ok(out as usize)
}

/// The destination must already be writable; see [`protect`].
pub fn write(task: &Task, address: u64, data: &[u8]) -> Result<()> {
    let count = match mach_msg_type_number_t::try_from(data.len()) {
        Ok(0) | Err(_) => return Err(KernelError::new(KERN_INVALID_ARGUMENT).into()),
        Ok(count) => count,
    };
    let kr = unsafe { mach_vm_write(task.port(), address, data.as_ptr() as vm_offset_t, count) };
    Ok(KernelError::check(kr)?)
}

/// Out-of-line memory the kernel mapped into our task for `mach_vm_read`.
struct KernelBuffer {
    address: mach_vm_address_t,
    size: mach_vm_size_t,
}

impl KernelBuffer {
    fn as_slice(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.address as *const u8, self.size as usize) }
    }
}

impl Drop for KernelBuffer {
    fn drop(&mut self) {
        if self.size != 0 {
            unsafe { mach_vm_deallocate(mach_task_self(), self.address, self.size) };
        }
    }
}

impl VirtualMemoryRead for Task {
    fn read_at(&self, address: u64, size: u64) -> Result<Vec<u8>> {
        read(self, address, size)
    }

    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        read_into(self, address, buf)
    }
}

impl VirtualMemoryWrite for Task {
    fn write_at(&self, address: u64, data: &[u8]) -> Result<()> {
        write(self, address, data)
    }
}

impl VirtualMemoryProtect for Task {
    fn protect(&self, address: u64, size: u64, protection: Protection) -> Result<()> {
        protect(self, address, size, protection)
    }
}

/// Walks a task's address space with `mach_vm_region`, lowest address first.
pub struct RegionIter<'a> {
    task: &'a Task,
    addr: mach_vm_address_t,
    done: bool,
}

impl<'a> RegionIter<'a> {
    pub(crate) const fn new(task: &'a Task) -> Self {
        Self { task, addr: 0, done: false }
    }
}

impl Iterator for RegionIter<'_> {
    type Item = Result<MemoryRegion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut addr = self.addr;
        let mut size: mach_vm_size_t = 0;
        let mut count = vm_region_extended_info::count();
        let mut object_name: mach_port_t = 0;
        let mut info = unsafe { mem::zeroed::<vm_region_extended_info_data_t>() };

        let kr = unsafe {
            mach_vm_region(
                self.task.port(),
                &mut addr,
                &mut size,
                VM_REGION_EXTENDED_INFO,
                &mut info as *mut _ as vm_region_info_t,
                &mut count,
                &mut object_name,
            )
        };

        match kr {
            KERN_SUCCESS => {}
            // past the last region
            KERN_INVALID_ADDRESS => {
                self.done = true;
                return None;
            }
            code => {
                self.done = true;
                return Some(Err(KernelError::new(code).into()));
            }
        }

        if size == 0 {
            self.done = true;
            return None;
        }
        match addr.checked_add(size) {
            Some(next) => self.addr = next,
            None => self.done = true,
        }

        Some(Ok(MemoryRegion {
            base: addr,
            size,
            protection: Protection::from_bits(info.protection),
            user_tag: info.user_tag,
        }))
    }
}
