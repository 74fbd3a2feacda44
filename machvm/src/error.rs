use thiserror::Error as ThisError;

use super::{
    kern::{self, KernReturn, KERN_SUCCESS},
    macho::ParseError,
    Pid,
};

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("permission denied: cannot acquire the task of pid {pid}")]
    Permission { pid: Pid },
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl Error {
    /// The native kernel return code, when the failure came from a kernel call.
    pub fn kern_return(&self) -> Option<KernReturn> {
        match self {
            Error::Kernel(err) => Some(err.code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum NotFound {
    #[error("no such process: {0}")]
    Process(Pid),
    #[error("no main binary header found in process {0}")]
    MainBinary(Pid),
}

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("kernel return code {code}: {message}")]
pub struct KernelError {
    pub code: KernReturn,
    pub message: &'static str,
}

impl KernelError {
    pub fn new(code: KernReturn) -> Self {
        Self { code, message: kern::describe(code) }
    }

    /// Converts a raw kernel return into `Ok` or the matching `KernelError`.
    #[inline]
    pub fn check(code: KernReturn) -> Result<(), Self> {
        if code == KERN_SUCCESS {
            Ok(())
        } else {
            Err(Self::new(code))
        }
    }
}

#[test]
fn test_kernel_error_check() {
    assert!(KernelError::check(KERN_SUCCESS).is_ok());

    let err = KernelError::check(kern::KERN_INVALID_ADDRESS).unwrap_err();
    assert_eq!(err.code, kern::KERN_INVALID_ADDRESS);
    assert_eq!(err.to_string(), "kernel return code 1: specified address is not currently valid");

    let err = Error::from(err);
    assert_eq!(err.kern_return(), Some(kern::KERN_INVALID_ADDRESS));
}

#[test]
fn test_error_display() {
    assert_eq!(Error::from(NotFound::Process(42)).to_string(), "no such process: 42");
    assert_eq!(Error::Permission { pid: 1 }.to_string(), "permission denied: cannot acquire the task of pid 1");
    assert_eq!(Error::from(NotFound::MainBinary(7)).kern_return(), None);
}
