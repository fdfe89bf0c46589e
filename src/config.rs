use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::block::MIN_LOG_BLOCK_SIZE;
use crate::{LogAllocator, Result};

/// Top-level configuration for the log allocator.
///
/// # Examples
///
/// ```
/// let _config = vellum::Config::default()
///     .path("/path/to/log")
///     .segment_size(8 * 1024 * 1024)
///     .log_buf_size(256 * 1024)
///     .durable_mark_timeout_ms(50);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) segment_size: usize,
    pub(crate) num_segments: usize,
    pub(crate) log_buf_size: usize,
    pub(crate) payload_align: usize,
    pub(crate) durable_mark_timeout: Duration,
    pub(crate) reserved_log_bytes: u64,
    pub(crate) path: PathBuf,
    pub(crate) temporary: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            segment_size: 1024 * 1024,
            num_segments: 16,
            log_buf_size: 64 * 1024,
            payload_align: 8,
            durable_mark_timeout: Duration::from_millis(100),
            reserved_log_bytes: 0,
            path: PathBuf::from("vellum_log"),
            temporary: false,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc = $desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    };
}

impl Config {
    builder!(
        (segment_size, usize, "size of each on-disk log segment file in bytes"),
        (num_segments, usize, "number of segment slots in the fixed segment ring"),
        (log_buf_size, usize, "capacity of the in-memory staging ring buffer; must be a power of two and a multiple of the page size"),
        (payload_align, usize, "required alignment of payload byte counts passed to allocate"),
        (reserved_log_bytes, u64, "red-zone reservation: allocate returns LogFull rather than letting the un-flushed span grow past total capacity minus this many bytes. 0 disables the check"),
        (temporary, bool, "if this log should be removed after the allocator is dropped")
    );

    /// Set the directory where segment files and the durable mark live.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Config {
        self.path = path.as_ref().to_path_buf();
        self
    }

    /// How often the daemon pushes the durable mark to disk, in
    /// milliseconds.
    pub fn durable_mark_timeout_ms(mut self, to: u64) -> Config {
        self.durable_mark_timeout = Duration::from_millis(to);
        self
    }

    /// Open the log allocator described by this configuration,
    /// spawning its writer daemon.
    pub fn open(self) -> Result<LogAllocator> {
        self.validate();
        LogAllocator::start(self)
    }

    pub(crate) fn validate(&self) {
        assert!(
            self.segment_size >= 4 * MIN_LOG_BLOCK_SIZE,
            "segment_size of {} is too small to hold even a handful of blocks",
            self.segment_size
        );
        assert!(self.num_segments >= 2, "num_segments must be at least 2");
        assert!(
            self.log_buf_size.is_power_of_two(),
            "log_buf_size must be a power of two"
        );
        assert_eq!(
            self.log_buf_size % page_size(),
            0,
            "log_buf_size must be a multiple of the page size"
        );
        assert!(
            self.payload_align.is_power_of_two(),
            "payload_align must be a power of two"
        );
    }

    pub(crate) fn run_path(&self) -> PathBuf {
        if self.temporary && self.path == Config::default().path {
            // an anonymous scratch directory, never reused
            static SALT: std::sync::atomic::AtomicUsize =
                std::sync::atomic::AtomicUsize::new(0);
            let salt = SALT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let now = std::time::UNIX_EPOCH.elapsed().unwrap().as_nanos();

            #[cfg(target_os = "linux")]
            let base = PathBuf::from("/dev/shm");
            #[cfg(not(target_os = "linux"))]
            let base = std::env::temp_dir();

            base.join(format!("vellum.tmp.{}.{}", now, salt))
        } else {
            self.path.clone()
        }
    }
}

pub(crate) fn page_size() -> usize {
    #[cfg(unix)]
    {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(ret > 0);
        ret as usize
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = Config::default()
            .segment_size(1 << 16)
            .num_segments(4)
            .log_buf_size(8192)
            .reserved_log_bytes(1024)
            .temporary(true);
        assert_eq!(config.segment_size, 1 << 16);
        assert_eq!(config.num_segments, 4);
        assert_eq!(config.log_buf_size, 8192);
        assert_eq!(config.reserved_log_bytes, 1024);
        assert!(config.temporary);
    }

    #[test]
    fn temporary_paths_are_unique() {
        let a = Config::default().temporary(true);
        let b = Config::default().temporary(true);
        assert_ne!(a.run_path(), b.run_path());
    }
}
