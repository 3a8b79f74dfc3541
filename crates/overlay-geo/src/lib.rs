//! Overlay Geo - Sketch preparation, rectangle covers, and clipping primitives
//!
//! This crate holds the CPU-bound geometry work of the overlay engine. Nothing
//! here performs I/O: candidates are handed in as iterators and results are
//! returned by value, so every function can run on a worker thread.

pub mod antimeridian;
pub mod area;
pub mod clip;
pub mod cover;
pub mod decompose;
pub mod hash;
pub mod overlap;
pub mod prepare;
pub mod transform;

pub use clip::{clip_sketch_to_polygons, CandidateError, ClipOutcome, ClipStats};
pub use cover::{
    build_indexes, cover_with_rectangles, Classification, CoverIndex, CoverOptions,
    RectangleCover,
};
pub use decompose::{decompose_overlaps, FragmentPiece};
pub use hash::{content_hash, HASH_PRECISION};
pub use overlap::{overlap_area_by_class, OverlapCandidate, OverlapOutcome};
pub use prepare::{prepare_sketch, PrepareOptions, PreparedSketch};
