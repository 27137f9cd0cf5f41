//! # cohort-prep
//!
//! Preprocessing for per-patient medical imaging cohorts: discover and
//! fuzzy-match files across named image sequences, resample every matched
//! volume to a common voxel spacing and z-score normalize the primary
//! sequence.
//!
//! The interesting part is the identity matcher: heterogeneous file names
//! are grouped into one record per subject, keyed by a subject id derived
//! from the file name; when several files could belong to the same subject
//! and sequence, the one with the best partial fuzzy ratio against the
//! subject's primary file wins, with ties broken by listing order so runs
//! are reproducible. Resampling and normalization are plain volume
//! operations on top of that registry.
//!
//! # Examples
//!
//! ## Resolving a cohort and processing it
//!
//! ```no_run
//! # use cohort_prep::pipeline::{self, PipelineConfig};
//! let config = PipelineConfig::from_json_file("cohort.json")
//!     .expect("should have loaded the run configuration");
//! let registry = pipeline::run(&config).expect("pipeline should have completed");
//! for (subject, record) in registry.iter() {
//!     println!("{subject}: {} sequences", record.len());
//! }
//! ```
//!
//! ## Matching only
//!
//! ```no_run
//! # use cohort_prep::matcher::FileMatcher;
//! let matcher = FileMatcher::new("/data/cohort");
//! let files = matcher
//!     .collect_file_names(&["ART"], Some(".nii"))
//!     .expect("should have listed the base directory");
//! let registry = matcher
//!     .find_unique_ids(&files, "arterial")
//!     .expect("subject ids should be derivable");
//! ```

pub mod enums;
pub mod matcher;
pub mod normalize;
pub mod pipeline;
pub mod resample;
pub mod similarity;
pub mod volume;
pub mod volume_io;

// Re-exports for convenience
pub use enums::Interpolation;
pub use matcher::{FileMatcher, MatcherError, Registry, SubjectRecord};
pub use normalize::NormalizeError;
pub use pipeline::{PipelineConfig, PipelineError, SequenceSpec};
pub use resample::ResampleError;
pub use volume::{Geometry, Volume};
pub use volume_io::{VolumeIo, VolumeIoError};
