//! Error and status codes returned across the public API.

/// Errors surfaced by a fallible call. Never panics, never throws; every
/// fallible operation returns one of these via an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Session has not been opened yet.
    NeverOpen,
    /// `open` called again with parameters that differ from the live session.
    AlreadyOpen,
    /// Null/empty/zero credential or out-of-range argument.
    BadParameters,
    /// Insertion would exceed a bounded collection and no victim could be evicted.
    TooMany,
    /// Request-context workspace failed magic/size/CRC validation.
    BadWorkspace,
    /// Session state buffer failed magic/size/CRC validation.
    BadState,
    /// A wall clock was required but unavailable.
    BadTime,
    /// Wire encoding failed (buffer too small, or an invariant was violated).
    EncodeError,
    /// Wire decoding failed (malformed header, bad crypto framing, bad protobuf).
    DecodeError,
    /// A host-supplied resource (random source, clock) failed.
    ResourceUnavailable,
    /// `close` was called on a session that was never opened.
    Close,
    /// AES key is invalid.
    BadKey,
    /// `finalize_request` called with no beacons and no GNSS fix.
    NoBeacons,
    /// Cache insertion failed.
    AddCache,
    /// Cache lookup failed.
    GetCache,
    /// Decoded response carried no usable location.
    LocationUnknown,
    /// Server returned a server-side error status.
    ServerError,
    /// Every plugin in the chain declined to answer an operation.
    NoPlugin,
    /// Registration/auth backoff forbids a request right now.
    ServiceDenied,
    /// Non-error: caller must resubmit (TBR registration round-trip or auth retry).
    Auth,
}

impl Error {
    /// Short human-readable description, the idiomatic replacement for the
    /// original `sky_perror(Sky_errno_t)` string table lookup.
    pub fn as_str(&self) -> &'static str {
        match self {
            Error::NeverOpen => "session never opened",
            Error::AlreadyOpen => "session already open with different parameters",
            Error::BadParameters => "bad parameters",
            Error::TooMany => "too many beacons",
            Error::BadWorkspace => "corrupt or mismatched request workspace",
            Error::BadState => "corrupt or mismatched session state",
            Error::BadTime => "no usable time source",
            Error::EncodeError => "failed to encode request",
            Error::DecodeError => "failed to decode response",
            Error::ResourceUnavailable => "required host resource unavailable",
            Error::Close => "close called without a live session",
            Error::BadKey => "bad AES key",
            Error::NoBeacons => "no beacons in request",
            Error::AddCache => "failed to add to cache",
            Error::GetCache => "failed to read from cache",
            Error::LocationUnknown => "location unknown",
            Error::ServerError => "server returned an error",
            Error::NoPlugin => "no plugin answered the operation",
            Error::ServiceDenied => "service denied, backoff in effect",
            Error::Auth => "authentication retry required",
        }
    }
}

/// Result of `finalize_request`: either a cache hit (location filled in, no
/// bytes written) or a request ready to transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// `loc` was filled from the cache; nothing was written to the request buffer.
    Location,
    /// The request buffer was written; send `response_size` worth of response space.
    Request,
}

pub type Result<T> = core::result::Result<T, Error>;
