//! A library for generating crash signatures from processed crash data.
//!
//! A signature is a short human-readable string derived from a crash
//! report's stack frames and annotations, used to group crash reports into
//! buckets for triage. Identical input always produces an identical
//! signature -- signatures are keys across the whole crash-stats system.
//!
//! The entry point is [`SignatureGenerator`]: build one over the packaged
//! classification lists (or a deployment's overrides of them), then feed it
//! [`CrashData`] documents:
//!
//! ```
//! use siggen::{CrashData, SignatureGenerator};
//!
//! let generator = SignatureGenerator::new().unwrap();
//! let crash_data: CrashData = serde_json::from_str("{}").unwrap();
//! let result = generator.generate(&crash_data);
//! assert_eq!(result.signature, "EMPTY: no crashing thread identified");
//! ```
//!
//! The generator runs an ordered pipeline of rules; each rule's failures
//! are contained and recorded as notes, so `generate()` always produces a
//! signature. The classification lists are immutable once loaded and safe
//! to share across threads behind an `Arc`.

mod c_signature;
mod crash_data;
mod generator;
mod java_signature;
mod rules;
mod siglists;
mod utils;

pub use c_signature::*;
pub use crash_data::*;
pub use generator::*;
pub use java_signature::*;
pub use rules::*;
pub use siglists::*;
pub use utils::{
    collapse, drop_bad_characters, drop_prefix_and_return_type, generify_hex_addresses,
    parse_source_file,
};
