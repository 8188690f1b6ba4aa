//! `keychain` is an embeddable, log-structured key-value store in the
//! [Bitcask] family: every write is appended to a log file, and an in-memory
//! index (the "keydir") maps each live key straight to the file offset of its
//! value. Reads never scan the log; writes never rewrite it in place.
//!
//! ```no_run
//! use keychain::Config;
//!
//! let engine = Config::default().open("/tmp/my-store")?;
//! engine.set(b"key", b"value")?;
//! assert_eq!(engine.get(b"key")?.as_deref(), Some(&b"value"[..]));
//! engine.close()?;
//! # Ok::<(), keychain::Error>(())
//! ```
//!
//! The directory layout, on-disk record format, and recovery protocol are a
//! library-only core: there is no network server or CLI here, and no
//! automatic compaction of old segments. The on-disk format is stable enough
//! that a compactor could be written against it later without touching this
//! crate.
//!
//! [Bitcask]: https://riak.com/assets/bitcask-intro.pdf

mod clock;
mod codec;
mod config;
mod engine;
mod error;
mod keydir;
mod recovery;
mod scanner;
mod segment;

pub use clock::{Clock, ManualClock, WallClock};
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use segment::LogStatistics;
