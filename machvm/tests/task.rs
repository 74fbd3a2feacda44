#![cfg(target_os = "macos")]

use machvm::{
    aslr_offset, find_main_binary, get_image_size, protect, read, read_into, write, Error, ImageLocator, NotFound,
    Protection, Task, VirtualMemoryRead, VirtualMemoryWrite,
};
use std::{process::Command, sync::Mutex};

use machx::{
    kern_return::kern_return_t,
    mach_port::mach_port_deallocate,
    mach_types::ipc_space_t,
    port::{mach_port_name_t, mach_port_right_t, mach_port_urefs_t, MACH_PORT_RIGHT_SEND},
    traps::mach_task_self,
    vm::{mach_vm_allocate, mach_vm_deallocate},
    vm_statistics::VM_FLAGS_ANYWHERE,
};

extern "C" {
    fn mach_port_get_refs(
        task: ipc_space_t,
        name: mach_port_name_t,
        right: mach_port_right_t,
        refs: *mut mach_port_urefs_t,
    ) -> kern_return_t;
}

/// `task_for_pid` on ourselves adds user references to the `mach_task_self()`
/// name, so tests that count them must not overlap.
static SELF_PORT: Mutex<()> = Mutex::new(());

fn send_refs(name: mach_port_name_t) -> mach_port_urefs_t {
    let mut refs = 0;
    let kr = unsafe { mach_port_get_refs(mach_task_self(), name, MACH_PORT_RIGHT_SEND, &mut refs) };
    assert_eq!(kr, 0);
    refs
}

/// Fresh anonymous memory in our own task, so protections can be changed
/// without disturbing the allocator.
struct Scratch {
    addr: u64,
    size: u64,
}

impl Scratch {
    fn new(size: u64) -> Self {
        let mut addr = 0;
        let kr = unsafe { mach_vm_allocate(mach_task_self(), &mut addr, size, VM_FLAGS_ANYWHERE) };
        assert_eq!(kr, 0);
        Self { addr, size }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        unsafe { mach_vm_deallocate(mach_task_self(), self.addr, self.size) };
    }
}

fn pid() -> i32 {
    unsafe { libc::getpid() }
}

#[test]
fn test_self_round_trip() {
    let task = Task::current();
    let scratch = Scratch::new(0x4000);
    let data = b"written through the task port";

    write(&task, scratch.addr + 0x10, data).unwrap();
    assert_eq!(read(&task, scratch.addr + 0x10, data.len() as u64).unwrap(), data);

    let mut buf = [0_u8; 7];
    assert_eq!(read_into(&task, scratch.addr + 0x10, &mut buf).unwrap(), 7);
    assert_eq!(&buf, b"written");
}

#[test]
fn test_read_spans_pages() {
    let task = Task::current();
    let scratch = Scratch::new(0x10000);
    let data: Vec<u8> = (0..0x9000_u32).map(|i| i as u8).collect();

    task.write_at(scratch.addr + 0x100, &data).unwrap();
    let back = task.read_at(scratch.addr + 0x100, data.len() as u64).unwrap();
    assert_eq!(back, data);
}

#[test]
fn test_read_only_rejects_write() {
    let task = Task::current();
    let scratch = Scratch::new(0x4000);

    protect(&task, scratch.addr, scratch.size, Protection::READ).unwrap();
    let err = write(&task, scratch.addr, b"nope").unwrap_err();
    assert!(matches!(err, Error::Kernel(_)), "{err}");

    protect(&task, scratch.addr, scratch.size, Protection::DEFAULT).unwrap();
    write(&task, scratch.addr, b"ok").unwrap();
    assert_eq!(read(&task, scratch.addr, 2).unwrap(), b"ok");
}

#[test]
fn test_invalid_ranges() {
    let task = Task::current();
    assert!(matches!(read(&task, 0, 0x10), Err(Error::Kernel(_))));
    assert!(matches!(read(&task, 0x1000, 0), Err(Error::Kernel(_))));
    assert!(matches!(write(&task, 0x1000, &[]), Err(Error::Kernel(_))));
    assert!(matches!(protect(&task, 0x1000, 0, Protection::READ), Err(Error::Kernel(_))));
}

#[test]
fn test_missing_process() {
    let err = Task::for_pid(99_999_999).unwrap_err();
    assert!(matches!(err, Error::NotFound(NotFound::Process(99_999_999))), "{err}");

    let err = Task::for_pid(-5).unwrap_err();
    assert!(matches!(err, Error::NotFound(NotFound::Process(-5))), "{err}");
}

#[test]
fn test_regions_are_ordered() {
    let task = Task::current();
    let regions = task.regions().collect::<Result<Vec<_>, _>>().unwrap();
    assert!(!regions.is_empty());
    assert!(regions.iter().all(|r| r.size > 0));
    assert!(regions.windows(2).all(|w| w[0].end() <= w[1].base));
}

#[test]
fn test_main_binary_of_self() {
    let expected_base = unsafe { libc::_dyld_get_image_header(0) } as u64;
    let expected_slide = unsafe { libc::_dyld_get_image_vmaddr_slide(0) } as i64;

    let task = Task::current();
    let image = ImageLocator::new(&task).main_image().unwrap();
    assert_eq!(image.base, expected_base);
    assert_eq!(image.slide(), expected_slide);
    assert!(image.size > 0);
}

#[test]
fn test_aslr_offset_by_pid() {
    let _guard = SELF_PORT.lock().unwrap_or_else(|e| e.into_inner());
    let pid = pid();
    let address = find_main_binary(pid).unwrap();
    let size = get_image_size(address, pid).unwrap();
    assert!(size > 0);

    let task = Task::for_pid(pid).unwrap();
    let image = ImageLocator::new(&task).image(address).unwrap();
    let offset = aslr_offset(pid).unwrap();
    assert_eq!(offset, address.wrapping_sub(image.preferred_base) as i64);
    assert_eq!(aslr_offset(pid).unwrap(), offset);
}

#[test]
fn test_owned_task_released_on_drop() {
    let _guard = SELF_PORT.lock().unwrap_or_else(|e| e.into_inner());
    let before = send_refs(unsafe { mach_task_self() });

    let task = Task::for_pid(pid()).unwrap();
    assert!(!task.is_current());
    assert_eq!(send_refs(task.port()), before + 1);
    drop(task);
    assert_eq!(send_refs(unsafe { mach_task_self() }), before);
}

#[test]
fn test_into_raw_keeps_reference() {
    let _guard = SELF_PORT.lock().unwrap_or_else(|e| e.into_inner());
    let before = send_refs(unsafe { mach_task_self() });

    let port = Task::for_pid(pid()).unwrap().into_raw();
    assert_eq!(send_refs(port), before + 1);
    assert_eq!(unsafe { mach_port_deallocate(mach_task_self(), port) }, 0);
    assert_eq!(send_refs(port), before);
}

#[test]
fn test_current_task_never_released() {
    let _guard = SELF_PORT.lock().unwrap_or_else(|e| e.into_inner());
    let before = send_refs(unsafe { mach_task_self() });

    let task = Task::current();
    assert!(task.is_current());
    assert_eq!(task.port(), unsafe { mach_task_self() });
    drop(task);
    assert_eq!(send_refs(unsafe { mach_task_self() }), before);

    let scratch = Scratch::new(0x4000);
    write(&Task::current(), scratch.addr, b"still alive").unwrap();
    assert_eq!(read(&Task::current(), scratch.addr, 11).unwrap(), b"still alive");
}

#[test]
fn test_aslr_offset_of_child() {
    let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
    let pid = child.id() as i32;

    let first = aslr_offset(pid);
    let second = aslr_offset(pid);
    let image = find_main_binary(pid).and_then(|address| {
        let task = Task::for_pid(pid)?;
        ImageLocator::new(&task).image(address)
    });
    child.kill().unwrap();
    child.wait().unwrap();

    // Without the debugger entitlement the child is off limits.
    match (first, second, image) {
        (Ok(first), Ok(second), Ok(image)) => {
            assert_eq!(first, second);
            assert_eq!(first, image.slide());
            assert!(image.size > 0);
        }
        (Err(err), ..) => assert!(matches!(err, Error::Permission { pid: p } if p == pid), "{err}"),
        (first, second, image) => panic!("inconsistent results: {first:?} {second:?} {image:?}"),
    }
}
