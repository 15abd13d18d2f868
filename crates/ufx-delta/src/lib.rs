//! UFX Delta Engine
//!
//! Given a directory of jars named `1.jar`, `2.jar`, ... computes GDIFF
//! patches `2.jar.bpatch`, `3.jar.bpatch`, ... where each patch applies to the
//! full jar produced by the previous one. Inputs should be uncompressed jars;
//! compression happens afterwards, optionally, with gzip.

mod engine;
pub mod gdiff;

pub use engine::{process_all, process_pair, DeltaError, PatchRecord};
