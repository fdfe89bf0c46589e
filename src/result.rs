use std::{
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

/// The top-level result type for fallible operations.
/// The errors tend to be fail-stop: anything that cannot
/// be recovered locally without risking a hole in the log
/// terminates the process instead of surfacing here.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating the issues that may come up
/// while constructing or feeding a log allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The system has been used in an unsupported way.
    Unsupported(&'static str),
    /// An unexpected bug has happened. Please open an issue on github!
    ReportableBug(&'static str),
    /// A read or write error has happened when interacting with the file
    /// system.
    Io(io::ErrorKind, &'static str),
    /// The configured red zone would be breached: admitting this
    /// allocation could wedge the log. Retry after the durable
    /// watermark advances.
    LogFull,
    /// Corruption was detected in the on-disk durable mark.
    Corruption {
        /// The file offset at which corrupted data was found.
        at: u64,
    },
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error.kind(), "io error")
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        use self::Error::*;
        use std::io::ErrorKind;
        match error {
            Io(kind, reason) => io::Error::new(kind, reason),
            Unsupported(why) => io::Error::new(
                ErrorKind::InvalidInput,
                format!("operation not supported: {:?}", why),
            ),
            ReportableBug(what) => io::Error::new(
                ErrorKind::Other,
                format!(
                    "unexpected bug! please report this bug at <github.com/vellum-db/vellum>: {:?}",
                    what
                ),
            ),
            LogFull => io::Error::new(
                ErrorKind::WouldBlock,
                "log full: red zone reached",
            ),
            Corruption { .. } => io::Error::new(
                ErrorKind::InvalidData,
                format!("corruption encountered: {:?}", error),
            ),
        }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
            Io(ref kind, ref reason) => {
                write!(f, "IO error: ({:?}, {})", kind, reason)
            }
            LogFull => write!(
                f,
                "Log full: admitting this allocation would \
                 breach the configured red zone"
            ),
            Corruption { at } => {
                write!(f, "Read corrupted data at file offset {}", at)
            }
        }
    }
}
