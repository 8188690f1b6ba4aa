//! Tunable options for opening a store, mirroring how a production Bitcask
//! deployment would want to configure durability and segment sizing.

use std::path::Path;
use std::sync::Arc;

use bytesize::ByteSize;

use crate::clock::{Clock, WallClock};
use crate::engine::Engine;
use crate::error::Result;

/// Builder for the options `Engine::open` accepts. Construct with
/// [`Config::default`], chain the setters, then call [`Config::open`].
#[derive(Clone)]
pub struct Config {
    pub(crate) sync_on_write: bool,
    pub(crate) max_segment_size: ByteSize,
    pub(crate) max_key_size: ByteSize,
    pub(crate) max_value_size: ByteSize,
    pub(crate) clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("sync_on_write", &self.sync_on_write)
            .field("max_segment_size", &self.max_segment_size)
            .field("max_key_size", &self.max_key_size)
            .field("max_value_size", &self.max_value_size)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_segment_size: ByteSize::gib(2),
            max_key_size: ByteSize::kib(64),
            max_value_size: ByteSize::gib(1),
            clock: Arc::new(WallClock),
        }
    }
}

impl Config {
    /// Opens (or creates) a store at `path` with the accumulated options.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Engine> {
        Engine::open(path.as_ref(), self)
    }

    /// Sets whether `set`/`delete` fsync before returning. Default `true`.
    ///
    /// Disabling this trades durability for throughput: an unflushed write
    /// can be lost on a crash even though the call returned successfully,
    /// though it is never exposed to readers on the same live process before
    /// the record is at least handed to the kernel.
    pub fn sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    /// Sets the byte threshold at which the active segment rotates into an
    /// immutable one. Default `2 GiB`.
    pub fn max_segment_size(mut self, max_segment_size: ByteSize) -> Self {
        self.max_segment_size = max_segment_size;
        self
    }

    /// Sets the largest key the codec will accept before reporting the
    /// record as corrupt. Default `64 KiB`.
    pub fn max_key_size(mut self, max_key_size: ByteSize) -> Self {
        self.max_key_size = max_key_size;
        self
    }

    /// Sets the largest value the codec will accept before reporting the
    /// record as corrupt. Default `1 GiB`.
    pub fn max_value_size(mut self, max_value_size: ByteSize) -> Self {
        self.max_value_size = max_value_size;
        self
    }

    /// Overrides the clock used to timestamp records. Tests inject a
    /// [`crate::clock::ManualClock`] here to control write ordering
    /// deterministically; production code has no reason to call this.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let conf = Config::default();
        assert!(conf.sync_on_write);
        assert_eq!(conf.max_segment_size, ByteSize::gib(2));
        assert_eq!(conf.max_key_size, ByteSize::kib(64));
        assert_eq!(conf.max_value_size, ByteSize::gib(1));
    }

    #[test]
    fn builder_methods_chain_and_override() {
        let conf = Config::default()
            .sync_on_write(false)
            .max_segment_size(ByteSize::mib(16));
        assert!(!conf.sync_on_write);
        assert_eq!(conf.max_segment_size, ByteSize::mib(16));
    }
}
