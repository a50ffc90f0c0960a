//! Message-content compaction primitives consumed by `sa-memory`'s
//! `Memory::compact_session_view`. A production deployment plugs a real
//! summarizing [`compressor::Compressor`] in at its composition root; this
//! crate only supplies the truncating fallback.

pub mod compressor;
pub mod truncation;

pub use compressor::{Compressor, HeuristicCompressor};
