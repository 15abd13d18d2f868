//! Delta Engine seam
//!
//! The index builder only needs the two entry points below; the shipped
//! implementation forwards to the GDIFF engine in `ufx-delta`.

use std::path::Path;

pub use ufx_delta::{DeltaError, PatchRecord};

/// Computes binary patches between consecutive artifacts.
pub trait DeltaEngine {
    /// Patches for every consecutive pair of prepared artifacts in `in_dir`.
    fn process_all(&self, in_dir: &Path, out_dir: &Path, gzip_from: i64) -> Result<Vec<PatchRecord>, DeltaError>;

    /// Patch from `prev` to `cur`, producing `version`.
    fn process_pair(
        &self,
        prev: &Path,
        cur: &Path,
        out_dir: &Path,
        version: u32,
        gzip_from: i64,
    ) -> Result<PatchRecord, DeltaError>;
}

/// GDIFF-based engine
#[derive(Debug, Default, Clone, Copy)]
pub struct GdiffEngine;

impl DeltaEngine for GdiffEngine {
    fn process_all(&self, in_dir: &Path, out_dir: &Path, gzip_from: i64) -> Result<Vec<PatchRecord>, DeltaError> {
        ufx_delta::process_all(in_dir, out_dir, gzip_from)
    }

    fn process_pair(
        &self,
        prev: &Path,
        cur: &Path,
        out_dir: &Path,
        version: u32,
        gzip_from: i64,
    ) -> Result<PatchRecord, DeltaError> {
        ufx_delta::process_pair(prev, cur, out_dir, version, gzip_from)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// A recorded call made against [`RecordingEngine`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        All { in_dir: PathBuf, gzip_from: i64 },
        Pair { prev: PathBuf, cur: PathBuf, version: u32 },
    }

    /// Forwards to the GDIFF engine and records every call.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingEngine {
        pub(crate) calls: Mutex<Vec<Call>>,
    }

    impl RecordingEngine {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DeltaEngine for RecordingEngine {
        fn process_all(&self, in_dir: &Path, out_dir: &Path, gzip_from: i64) -> Result<Vec<PatchRecord>, DeltaError> {
            self.calls.lock().unwrap().push(Call::All {
                in_dir: in_dir.to_path_buf(),
                gzip_from,
            });
            GdiffEngine.process_all(in_dir, out_dir, gzip_from)
        }

        fn process_pair(
            &self,
            prev: &Path,
            cur: &Path,
            out_dir: &Path,
            version: u32,
            gzip_from: i64,
        ) -> Result<PatchRecord, DeltaError> {
            self.calls.lock().unwrap().push(Call::Pair {
                prev: prev.to_path_buf(),
                cur: cur.to_path_buf(),
                version,
            });
            GdiffEngine.process_pair(prev, cur, out_dir, version, gzip_from)
        }
    }
}
