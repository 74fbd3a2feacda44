use std::{io, mem};

use machx::{
    mach_port::mach_port_deallocate,
    port::{mach_port_name_t, MACH_PORT_NULL},
    traps::{mach_task_self, task_for_pid},
};

use super::{
    kern::{KERN_FAILURE, KERN_INVALID_ARGUMENT, KERN_PROTECTION_FAILURE, KERN_SUCCESS},
    memory::RegionIter,
    Error, KernelError, MemoryRegion, NotFound, Pid, ProcessInfo, Result,
};

/// A send right to a task's port, i.e. the capability to operate on its
/// address space.
///
/// Rights obtained through [`Task::for_pid`] are released when the `Task` is
/// dropped. The right returned by [`Task::current`] belongs to the process and
/// is never released.
#[derive(Debug)]
pub struct Task {
    pid: Pid,
    port: mach_port_name_t,
    owned: bool,
}

impl Task {
    pub fn current() -> Self {
        Self { pid: unsafe { libc::getpid() }, port: unsafe { mach_task_self() }, owned: false }
    }

    /// Requires root or the `com.apple.security.cs.debugger` entitlement for
    /// any process other than the caller.
    pub fn for_pid(pid: Pid) -> Result<Self> {
        if pid < 0 {
            return Err(NotFound::Process(pid).into());
        }

        let mut port: mach_port_name_t = MACH_PORT_NULL;
        let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut port) };
        match kr {
            KERN_SUCCESS => {
                log::debug!("acquired task port {port:#x} for pid {pid}");
                Ok(Self { pid, port, owned: true })
            }
            KERN_PROTECTION_FAILURE => Err(Error::Permission { pid }),
            // task_for_pid answers KERN_FAILURE both for a missing process and
            // for a denied one.
            KERN_FAILURE | KERN_INVALID_ARGUMENT => match process_exists(pid) {
                true => Err(Error::Permission { pid }),
                false => Err(NotFound::Process(pid).into()),
            },
            code => Err(KernelError::new(code).into()),
        }
    }

    pub const fn pid(&self) -> Pid {
        self.pid
    }

    pub const fn port(&self) -> mach_port_name_t {
        self.port
    }

    pub const fn is_current(&self) -> bool {
        !self.owned
    }

    /// Gives up ownership of the port without releasing it.
    pub fn into_raw(self) -> mach_port_name_t {
        let port = self.port;
        mem::forget(self);
        port
    }

    pub fn regions(&self) -> RegionIter<'_> {
        RegionIter::new(self)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.owned || self.port == MACH_PORT_NULL {
            return;
        }
        let kr = unsafe { mach_port_deallocate(mach_task_self(), self.port) };
        log::trace!("released task port {:#x} for pid {}: {kr}", self.port, self.pid);
    }
}

impl ProcessInfo for Task {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn get_maps(&self) -> Box<dyn Iterator<Item = Result<MemoryRegion>> + '_> {
        Box::new(self.regions())
    }
}

fn process_exists(pid: Pid) -> bool {
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
