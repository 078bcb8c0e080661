use std::{fmt::Display, result};

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    Unspecified(String),
    Unimplemented(String),
    Unhandled(Box<dyn std::error::Error + Send + Sync>),
    IoError(std::io::Error),
    /// Device returned a response that we could not properly handle
    BadResponse(String),
    /// Device or driver does not support configuration/functionality
    NotSupported(String),
    /// Timed out during an operation
    Timeout(String),
    /// Malformed XDR/RPC wire data
    Decode(String),
    /// No adapter, link, or device exists for the given name/id
    NotFound(String),
    /// Configuration document failed validation at load time
    Config(String),
    /// A mapping rule could not be matched against an incoming command
    NoMatchingRule(String),
    /// A MODBUS slave returned an exception PDU
    ModbusException { function: u8, code: u8 },
    /// The device lock is held by another link
    Locked,
    /// The caller does not hold the lock it is trying to release
    NotLockHolder,
    /// write()/read() issued before a successful acquire()
    NotAcquired,
}
impl std::error::Error for Error {}
impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Unspecified(desc) => write!(f, "Unspecified error: {desc}"),
            Error::Unimplemented(desc) => write!(f, "Unimplemented: {desc}"),
            Error::Unhandled(e) => write!(f, "Unhandled error: {e}"),
            Error::IoError(e) => write!(f, "IO error: {e}"),
            Error::BadResponse(e) => write!(f, "Bad response: {e}"),
            Error::NotSupported(e) => write!(f, "Not supported: {e}"),
            Error::Timeout(e) => write!(f, "Timed out: {e}"),
            Error::Decode(e) => write!(f, "Decode error: {e}"),
            Error::NotFound(e) => write!(f, "Not found: {e}"),
            Error::Config(e) => write!(f, "Configuration error: {e}"),
            Error::NoMatchingRule(e) => write!(f, "No mapping rule matched: {e}"),
            Error::ModbusException { function, code } => {
                write!(f, "MODBUS exception on function 0x{function:02X}: code 0x{code:02X}")
            }
            Error::Locked => write!(f, "device locked by another link"),
            Error::NotLockHolder => write!(f, "no lock held by this link"),
            Error::NotAcquired => write!(f, "adapter not acquired"),
        }
    }
}
impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

/// The VXI-11 device error codes returned to clients in a `Device_Error`
/// struct. Every RPC handler boils its result down to one of these before
/// it hits the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VxiError {
    NoError = 0,
    SyntaxError = 1,
    DeviceNotAccessible = 3,
    InvalidLinkIdentifier = 4,
    ParameterError = 5,
    ChannelNotEstablished = 6,
    OperationNotSupported = 8,
    OutOfResources = 9,
    DeviceLockedByAnotherLink = 11,
    NoLockHeldByThisLink = 12,
    IoTimeout = 15,
    IoError = 17,
    Abort = 23,
}
impl VxiError {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl From<&Error> for VxiError {
    fn from(err: &Error) -> Self {
        match err {
            Error::NotFound(_) => VxiError::DeviceNotAccessible,
            Error::NotSupported(_) | Error::NoMatchingRule(_) => VxiError::OperationNotSupported,
            Error::Config(_) | Error::BadResponse(_) | Error::Decode(_) => VxiError::SyntaxError,
            Error::Timeout(_) => VxiError::IoTimeout,
            Error::Locked => VxiError::DeviceLockedByAnotherLink,
            Error::NotLockHolder => VxiError::NoLockHeldByThisLink,
            Error::NotAcquired
            | Error::IoError(_)
            | Error::Unhandled(_)
            | Error::ModbusException { .. } => VxiError::IoError,
            Error::Unspecified(_) | Error::Unimplemented(_) => VxiError::IoError,
        }
    }
}
impl From<Error> for VxiError {
    fn from(err: Error) -> Self {
        (&err).into()
    }
}
