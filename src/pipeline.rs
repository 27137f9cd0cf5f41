//! Pipeline step sequencing: resolve the cohort registry, fan out
//! per-(subject, sequence) resampling, normalize the primary sequence and
//! write the metadata artifact.
//!
//! Fan-out units are independent and idempotent (each deterministically
//! overwrites its own output file); the join back into the registry is
//! sequential, so the registry never sees concurrent writers.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::enums::Interpolation;
use crate::matcher::{FileMatcher, MatcherError, Registry};
use crate::normalize::{self, NormalizeError};
use crate::resample::{self, ResampleError};
use crate::volume_io::{VolumeIo, VolumeIoError};

/// Suffix appended to both the sequence name and the file stem of
/// resampled outputs.
pub const PROCESSED_SUFFIX: &str = "_processed";

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceSpec {
    pub name: String,
    pub pattern: String,
}

/// Typed run configuration, loadable from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Directory searched recursively for cohort files.
    pub base_dir: PathBuf,
    /// Optional file-name suffix filter, e.g. `".nii"`.
    #[serde(default)]
    pub file_extension: Option<String>,
    /// Ordered sequence-name to search-pattern pairs.
    pub sequences: Vec<SequenceSpec>,
    /// The sequence every other sequence is matched against.
    pub primary: String,
    /// Target voxel spacing for resampling.
    #[serde(default = "default_spacing")]
    pub target_spacing: [f64; 3],
    /// Where the per-subject metadata JSON is written.
    pub out_metadata: PathBuf,
    #[serde(default = "default_delimiter")]
    pub id_delimiter: String,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
    #[serde(default)]
    pub interpolation: Interpolation,
}

fn default_spacing() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

fn default_delimiter() -> String {
    "_".to_string()
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    fn primary_pattern(&self) -> Result<&str, PipelineError> {
        self.sequences
            .iter()
            .find(|sequence| sequence.name == self.primary)
            .map(|sequence| sequence.pattern.as_str())
            .ok_or_else(|| PipelineError::UnknownPrimary(self.primary.clone()))
    }
}

/// Failure of one fan-out unit.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Io(#[from] VolumeIoError),

    #[error(transparent)]
    Resample(#[from] ResampleError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("primary sequence {0:?} is not in the sequence list")]
    UnknownPrimary(String),

    #[error(transparent)]
    Matcher(#[from] MatcherError),

    #[error("processing {sequence:?} for subject {subject:?} failed: {source}")]
    Unit {
        subject: String,
        sequence: String,
        #[source]
        source: UnitError,
    },

    #[error("failed to serialize metadata: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discover cohort files and resolve them into one record per subject.
pub fn resolve_cohort(config: &PipelineConfig) -> Result<Registry, PipelineError> {
    let pattern = config.primary_pattern()?;
    let matcher = FileMatcher::new(&config.base_dir)
        .case_insensitive(config.case_insensitive)
        .id_delimiter(config.id_delimiter.as_str());
    let extension = config.file_extension.as_deref();

    let primary_files = matcher.collect_file_names(&[pattern], extension)?;
    info!(
        files = primary_files.len(),
        pattern, "collected primary sequence files"
    );
    let mut registry = matcher.find_unique_ids(&primary_files, &config.primary)?;
    if registry.is_empty() {
        warn!(pattern, "no subjects matched the primary sequence");
    }

    for sequence in &config.sequences {
        let files = matcher.collect_file_names(&[sequence.pattern.as_str()], extension)?;
        debug!(
            sequence = sequence.name.as_str(),
            files = files.len(),
            "matching sequence files to subjects"
        );
        matcher.match_list_to_unique_ids(&mut registry, &files, &config.primary, &sequence.name);
    }

    info!(subjects = registry.len(), "cohort resolved");
    Ok(registry)
}

/// Resample every matched file to the target spacing, in parallel, and
/// record the `*_processed` outputs in the registry.
pub fn resample_stage(
    registry: &mut Registry,
    config: &PipelineConfig,
) -> Result<(), PipelineError> {
    let units: Vec<(String, String, PathBuf)> = registry
        .iter()
        .flat_map(|(subject, record)| {
            record.iter().map(move |(sequence, file)| {
                (subject.to_string(), sequence.to_string(), file.to_path_buf())
            })
        })
        .collect();
    info!(units = units.len(), "resampling cohort");

    let updates: Vec<(String, String, PathBuf)> = units
        .par_iter()
        .map(|(subject, sequence, file)| {
            let output = processed_path(file);
            resample_one(file, &output, config).map_err(|source| PipelineError::Unit {
                subject: subject.clone(),
                sequence: sequence.clone(),
                source,
            })?;
            Ok((
                subject.clone(),
                format!("{sequence}{PROCESSED_SUFFIX}"),
                output,
            ))
        })
        .collect::<Result<_, PipelineError>>()?;

    // sequential join, all fan-out work is done by now
    for (subject, sequence, output) in updates {
        if let Some(record) = registry.record_mut(&subject) {
            record.insert(sequence, output);
        }
    }
    Ok(())
}

/// Z-score normalize the primary sequence's resampled file of every
/// subject, overwriting it in place.
pub fn normalize_stage(registry: &Registry, config: &PipelineConfig) -> Result<(), PipelineError> {
    let key = format!("{}{}", config.primary, PROCESSED_SUFFIX);
    let units: Vec<(String, PathBuf)> = registry
        .iter()
        .filter_map(|(subject, record)| {
            record
                .get(&key)
                .map(|file| (subject.to_string(), file.to_path_buf()))
        })
        .collect();
    info!(units = units.len(), sequence = key.as_str(), "normalizing");

    units
        .par_iter()
        .map(|(subject, file)| {
            normalize_one(file).map_err(|source| PipelineError::Unit {
                subject: subject.clone(),
                sequence: key.clone(),
                source,
            })
        })
        .collect::<Result<(), PipelineError>>()
}

/// Write the per-subject metadata artifact as JSON.
pub fn write_metadata(registry: &Registry, path: &Path) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(registry)?;
    fs::write(path, json)?;
    info!(path = %path.display(), "wrote metadata");
    Ok(())
}

/// Run the whole pipeline: resolve, resample, normalize, write metadata.
pub fn run(config: &PipelineConfig) -> Result<Registry, PipelineError> {
    let mut registry = resolve_cohort(config)?;
    resample_stage(&mut registry, config)?;
    normalize_stage(&registry, config)?;
    write_metadata(&registry, &config.out_metadata)?;
    Ok(registry)
}

fn resample_one(input: &Path, output: &Path, config: &PipelineConfig) -> Result<(), UnitError> {
    let volume = VolumeIo::read(input)?;
    let resampled =
        resample::resample_to_spacing(&volume, config.target_spacing, config.interpolation)?;
    VolumeIo::write(&resampled, output)?;
    Ok(())
}

fn normalize_one(file: &Path) -> Result<(), UnitError> {
    let volume = VolumeIo::read(file)?;
    let normalized = normalize::zscore(&volume)?;
    VolumeIo::write(&normalized, file)?;
    Ok(())
}

/// `a/P1_ART.nii` becomes `a/P1_ART_processed.nii`, next to the input.
fn processed_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{stem}{PROCESSED_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{PROCESSED_SUFFIX}"),
    };
    input.with_file_name(name)
}
