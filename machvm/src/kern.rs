//! Kernel return codes and their descriptions.
//!
//! The table is built once per process and never mutated afterwards. Codes it
//! does not know about fall back to `mach_error_string` on macOS.

use std::collections::HashMap;

use lazy_static::lazy_static;

pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
pub const KERN_NO_SPACE: KernReturn = 3;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_FAILURE: KernReturn = 5;
pub const KERN_INVALID_NAME: KernReturn = 15;
pub const KERN_INVALID_TASK: KernReturn = 16;
pub const KERN_INVALID_RIGHT: KernReturn = 17;
pub const KERN_TERMINATED: KernReturn = 37;
pub const MACH_SEND_INVALID_DEST: KernReturn = 0x1000_0003;

const CODES: &[(KernReturn, &str, &str)] = &[
    (0, "KERN_SUCCESS", "success"),
    (1, "KERN_INVALID_ADDRESS", "specified address is not currently valid"),
    (2, "KERN_PROTECTION_FAILURE", "specified memory is valid, but does not permit the required forms of access"),
    (3, "KERN_NO_SPACE", "the address range specified is already in use, or no address range of the size specified could be found"),
    (4, "KERN_INVALID_ARGUMENT", "the function requested was not applicable to this type of argument, or an argument is invalid"),
    (5, "KERN_FAILURE", "the function could not be performed"),
    (6, "KERN_RESOURCE_SHORTAGE", "a system resource could not be allocated to fulfill this request"),
    (7, "KERN_NOT_RECEIVER", "the task in question does not hold receive rights for the port argument"),
    (8, "KERN_NO_ACCESS", "bogus access restriction"),
    (9, "KERN_MEMORY_FAILURE", "during a page fault, the target address refers to a memory object that has been destroyed"),
    (10, "KERN_MEMORY_ERROR", "during a page fault, the memory object indicated that the data could not be returned"),
    (11, "KERN_ALREADY_IN_SET", "the receive right is already a member of the portset"),
    (12, "KERN_NOT_IN_SET", "the receive right is not a member of a port set"),
    (13, "KERN_NAME_EXISTS", "the name already denotes a right in the task"),
    (14, "KERN_ABORTED", "the operation was aborted"),
    (15, "KERN_INVALID_NAME", "the name doesn't denote a right in the task"),
    (16, "KERN_INVALID_TASK", "target task isn't an active task"),
    (17, "KERN_INVALID_RIGHT", "the name denotes a right, but not an appropriate right"),
    (18, "KERN_INVALID_VALUE", "a blatant range error"),
    (19, "KERN_UREFS_OVERFLOW", "operation would overflow limit on user-references"),
    (20, "KERN_INVALID_CAPABILITY", "the supplied port capability is improper"),
    (21, "KERN_RIGHT_EXISTS", "the task already has send or receive rights for the port under another name"),
    (22, "KERN_INVALID_HOST", "target host isn't actually a host"),
    (23, "KERN_MEMORY_PRESENT", "an attempt was made to supply precious data for memory that is already present"),
    (24, "KERN_MEMORY_DATA_MOVED", "a page was requested of a memory manager via memory_object_data_request for an object using a MEMORY_OBJECT_COPY_CALL strategy"),
    (25, "KERN_MEMORY_RESTART_COPY", "a strategic copy was attempted of an object upon which a quicker copy is now possible"),
    (26, "KERN_INVALID_PROCESSOR_SET", "an argument applied to assert processor set privilege was not a processor set control port"),
    (27, "KERN_POLICY_LIMIT", "the specified scheduling attributes exceed the thread's limits"),
    (28, "KERN_INVALID_POLICY", "the specified scheduling policy is not currently enabled for the processor set"),
    (29, "KERN_INVALID_OBJECT", "the external memory manager failed to initialize the memory object"),
    (30, "KERN_ALREADY_WAITING", "a thread is attempting to wait for an event for which there is already a waiting thread"),
    (31, "KERN_DEFAULT_SET", "an attempt was made to destroy the default processor set"),
    (32, "KERN_EXCEPTION_PROTECTED", "an attempt was made to fetch an exception port that is protected"),
    (33, "KERN_INVALID_LEDGER", "a ledger was required but not supplied"),
    (34, "KERN_INVALID_MEMORY_CONTROL", "the port was not a memory cache control port"),
    (35, "KERN_INVALID_SECURITY", "an argument supplied to assert security privilege was not a host security port"),
    (36, "KERN_NOT_DEPRESSED", "thread_depress_abort was called on a thread which was not currently depressed"),
    (37, "KERN_TERMINATED", "object has been terminated and is no longer available"),
    (38, "KERN_LOCK_SET_DESTROYED", "lock set has been destroyed and is no longer available"),
    (39, "KERN_LOCK_UNSTABLE", "the thread holding the lock terminated before releasing the lock"),
    (40, "KERN_LOCK_OWNED", "the lock is already owned by another thread"),
    (41, "KERN_LOCK_OWNED_SELF", "the lock is already owned by the calling thread"),
    (42, "KERN_SEMAPHORE_DESTROYED", "semaphore has been destroyed and is no longer available"),
    (43, "KERN_RPC_SERVER_TERMINATED", "return from RPC indicating the target server was terminated before it successfully replied"),
    (44, "KERN_RPC_TERMINATE_ORPHAN", "terminate an orphaned activation"),
    (45, "KERN_RPC_CONTINUE_ORPHAN", "allow an orphaned activation to continue executing"),
    (46, "KERN_NOT_SUPPORTED", "empty thread activation (no thread linked to it)"),
    (47, "KERN_NODE_DOWN", "remote node down or inaccessible"),
    (48, "KERN_NOT_WAITING", "a signalled thread was not actually waiting"),
    (49, "KERN_OPERATION_TIMED_OUT", "some thread-oriented operation (semaphore_wait) timed out"),
    (50, "KERN_CODESIGN_ERROR", "during a page fault, indicates that the page was rejected as a result of a signature check"),
    (51, "KERN_POLICY_STATIC", "the requested property cannot be changed at this time"),
    (52, "KERN_INSUFFICIENT_BUFFER_SIZE", "the provided buffer is of insufficient size for the requested data"),
    (0x1000_0003, "MACH_SEND_INVALID_DEST", "(ipc/send) invalid destination port"),
    (0x1000_0004, "MACH_SEND_TIMED_OUT", "(ipc/send) timed out"),
];

lazy_static! {
    static ref REGISTRY: HashMap<KernReturn, (&'static str, &'static str)> =
        CODES.iter().map(|&(code, name, desc)| (code, (name, desc))).collect();
}

/// Symbolic name of a kernel return code, e.g. `KERN_INVALID_ADDRESS`.
pub fn name(code: KernReturn) -> Option<&'static str> {
    REGISTRY.get(&code).map(|&(name, _)| name)
}

/// Human-readable description of a kernel return code.
pub fn describe(code: KernReturn) -> &'static str {
    match REGISTRY.get(&code) {
        Some(&(_, desc)) => desc,
        None => fallback(code),
    }
}

#[cfg(target_os = "macos")]
fn fallback(code: KernReturn) -> &'static str {
    // mach_error_string returns pointers into static storage.
    let ptr = unsafe { machx::error::mach_error_string(code) };
    if ptr.is_null() {
        return "unknown kernel error";
    }
    unsafe { core::ffi::CStr::from_ptr(ptr) }.to_str().unwrap_or("unknown kernel error")
}

#[cfg(not(target_os = "macos"))]
fn fallback(_code: KernReturn) -> &'static str {
    "unknown kernel error"
}

#[test]
fn test_registry_lookup() {
    assert_eq!(name(KERN_INVALID_ADDRESS), Some("KERN_INVALID_ADDRESS"));
    assert_eq!(name(KERN_PROTECTION_FAILURE), Some("KERN_PROTECTION_FAILURE"));
    assert_eq!(describe(KERN_FAILURE), "the function could not be performed");
    assert_eq!(name(MACH_SEND_INVALID_DEST), Some("MACH_SEND_INVALID_DEST"));
    assert_eq!(name(KERN_INVALID_NAME), Some("KERN_INVALID_NAME"));
    assert_eq!(name(KERN_INVALID_TASK), Some("KERN_INVALID_TASK"));
    assert_eq!(name(KERN_INVALID_RIGHT), Some("KERN_INVALID_RIGHT"));
    assert_eq!(describe(KERN_TERMINATED), "object has been terminated and is no longer available");
    assert_eq!(name(-12345), None);
    assert!(!describe(-12345).is_empty());
}

#[test]
fn test_registry_codes_unique() {
    assert_eq!(REGISTRY.len(), CODES.len());
}
