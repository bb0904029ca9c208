use std::fmt;

/// FELib return codes as reported by the device layer.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum FELibReturn {
    Success = 0,
    Generic = -1,
    InvalidParam = -2,
    DevAlreadyOpen = -3,
    DevNotFound = -4,
    MaxDev = -5,
    Command = -6,
    Internal = -7,
    NotImplemented = -8,
    InvalidHandle = -9,
    DevLibNotAvailable = -10,
    Timeout = -11,
    Stop = -12,
    Disabled = -13,
    BadLibVer = -14,
    Comm = -15,
    Unknown = 1,
}

impl From<i32> for FELibReturn {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Success,
            -1 => Self::Generic,
            -2 => Self::InvalidParam,
            -3 => Self::DevAlreadyOpen,
            -4 => Self::DevNotFound,
            -5 => Self::MaxDev,
            -6 => Self::Command,
            -7 => Self::Internal,
            -8 => Self::NotImplemented,
            -9 => Self::InvalidHandle,
            -10 => Self::DevLibNotAvailable,
            -11 => Self::Timeout,
            -12 => Self::Stop,
            -13 => Self::Disabled,
            -14 => Self::BadLibVer,
            -15 => Self::Comm,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for FELibReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

impl std::error::Error for FELibReturn {}

impl FELibReturn {
    /// Interpret the result of a `hasdata` call.
    ///
    /// A timeout only means nothing is waiting, so it maps to `Ok(false)`.
    pub fn into_ready(self) -> Result<bool, FELibReturn> {
        match self {
            FELibReturn::Success => Ok(true),
            FELibReturn::Timeout => Ok(false),
            e => Err(e),
        }
    }
}

/// Outcome of a single `readdata` call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadStatus {
    Hit,
    NoData,
    Stopped,
}

impl ReadStatus {
    pub fn from_return(ret: FELibReturn) -> Result<Self, FELibReturn> {
        match ret {
            FELibReturn::Success => Ok(ReadStatus::Hit),
            FELibReturn::Timeout => Ok(ReadStatus::NoData),
            FELibReturn::Stop => Ok(ReadStatus::Stopped),
            e => Err(e),
        }
    }
}
