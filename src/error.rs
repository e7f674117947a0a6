// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the kvset tree
#[derive(Debug)]
pub enum Error {
    /// Invalid parameter at construction time (fanout out of range,
    /// prefix too long, ...)
    Invalid(&'static str),

    /// Invariant violation reached at runtime
    Bug(&'static str),

    /// The block allocator reports that the media is full
    NoSpace,

    /// Cancellation was observed
    ///
    /// Never reported through the health channel.
    Shutdown,

    /// Fatal structural corruption (dgen ordering break, spill queue
    /// head mismatch, ...)
    Corrupt(&'static str),

    /// Transient journal or media failure during commit
    Io(std::io::Error),
}

impl Error {
    /// Returns `true` if the error is the cancellation kind.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KvsetTreeError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Tree result
pub type Result<T> = std::result::Result<T, Error>;
