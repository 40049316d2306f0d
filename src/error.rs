//! Structured Errors

use crate::atom::Tag;
use std::error;
use std::fmt;
use std::result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Post-collection the node heap still cannot satisfy the request.
    ConsExhausted,
    /// Post-collection the vector heap still cannot satisfy the request.
    VectorExhausted,
    /// The requested element count overflows what a single allocation can hold.
    CannotAllocate { kbytes: usize },
    NegativeLength,
    InvalidLength { tag: Tag, length: isize },
    ProtectOverflow,
    ProtectImbalance,
    ProtectNotFound,
    BadFinalizerTarget { got: Tag },
    BadFinalizerFun { got: Tag },
    ScratchExhausted,
    ScratchUnknownPointer,
    OutOfMemory { bytes: usize },
    SomeError { msg: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub ty: ErrorKind,
}

impl From<ErrorKind> for Error {
    fn from(v: ErrorKind) -> Self {
        Error { ty: v }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error { ty: ErrorKind::SomeError { msg } }
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error { ty: ErrorKind::SomeError { msg: msg.to_string() } }
    }
}

fn fmt_error(err: &Error, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use ErrorKind::*;
    match &err.ty {
        ConsExhausted =>
            write!(f, "cons memory exhausted (limit reached?)"),
        VectorExhausted =>
            write!(f, "vector memory exhausted (limit reached?)"),
        CannotAllocate { kbytes } =>
            write!(f, "cannot allocate vector of size {} Kb", kbytes),
        NegativeLength =>
            write!(f, "negative length vectors are not allowed"),
        InvalidLength { tag, length } =>
            write!(f, "invalid type/length ({:?}/{}) in vector allocation",
                   tag, length),
        ProtectOverflow =>
            write!(f, "protect(): stack overflow"),
        ProtectImbalance =>
            write!(f, "unprotect(): stack imbalance"),
        ProtectNotFound =>
            write!(f, "unprotect_ptr: pointer not found"),
        BadFinalizerTarget { got } =>
            write!(f, "can only finalize reference objects, not {:?}", got),
        BadFinalizerFun { got } =>
            write!(f, "finalizer function must be a closure, not {:?}", got),
        ScratchExhausted =>
            write!(f, "scratch_alloc(): all pointers in use"),
        ScratchUnknownPointer =>
            write!(f, "scratch_free(): attempt to free pointer not allocated \
                       by scratch_alloc()"),
        OutOfMemory { bytes } =>
            write!(f, "could not allocate {} bytes from the system heap",
                   bytes),
        SomeError { msg } =>
            write!(f, "Error: {}", msg),
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        fmt_error(&Error { ty: self.clone() }, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        fmt_error(self, f)
    }
}

impl error::Error for ErrorKind {}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.ty)
    }
}

macro_rules! err {
    ($kind:ident) => {
        Err((crate::error::ErrorKind::$kind).into())
    };
    ($kind:ident, $($init:tt)* ) => {
        Err((crate::error::ErrorKind::$kind { $($init)* }).into())
    };
}

macro_rules! error {
    ($kind:ident) => {
        crate::error::Error { ty: crate::error::ErrorKind::$kind }
    };
    ($kind:ident, $($init:tt)* ) => {
        crate::error::Error {
            ty: crate::error::ErrorKind::$kind { $($init)* },
        }
    };
}
