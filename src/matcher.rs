//! Identity matcher: groups heterogeneous per-patient file names into one
//! record per subject, keyed by a subject id derived from the file name and
//! disambiguated by fuzzy similarity against the subject's primary file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::similarity::partial_ratio;

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("base directory not found: {0}")]
    BaseDirNotFound(PathBuf),

    #[error("cannot derive a subject id from {file} with delimiter {delimiter:?}")]
    AmbiguousId { file: PathBuf, delimiter: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sequence-name to file-path mapping for one subject.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct SubjectRecord {
    sequences: BTreeMap<String, PathBuf>,
}

impl SubjectRecord {
    pub fn get(&self, sequence: &str) -> Option<&Path> {
        self.sequences.get(sequence).map(PathBuf::as_path)
    }

    pub fn contains(&self, sequence: &str) -> bool {
        self.sequences.contains_key(sequence)
    }

    pub fn insert(&mut self, sequence: impl Into<String>, path: PathBuf) {
        self.sequences.insert(sequence.into(), path);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.sequences
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path()))
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Subject-id to record mapping for a whole cohort. Built once per run and
/// only ever grown; iteration order is the sorted subject-id order.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Registry {
    subjects: BTreeMap<String, SubjectRecord>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn record(&self, subject: &str) -> Option<&SubjectRecord> {
        self.subjects.get(subject)
    }

    pub fn record_mut(&mut self, subject: &str) -> Option<&mut SubjectRecord> {
        self.subjects.get_mut(subject)
    }

    pub fn entry(&mut self, subject: impl Into<String>) -> &mut SubjectRecord {
        self.subjects.entry(subject.into()).or_default()
    }

    pub fn subject_ids(&self) -> impl Iterator<Item = &str> {
        self.subjects.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SubjectRecord)> {
        self.subjects
            .iter()
            .map(|(id, record)| (id.as_str(), record))
    }
}

/// File discovery and identity resolution over one base directory.
///
/// Holds only configuration; every matching stage takes the registry it
/// updates explicitly, so there is no hidden state between stages.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    base_dir: PathBuf,
    case_insensitive: bool,
    id_delimiter: String,
}

impl FileMatcher {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            case_insensitive: true,
            id_delimiter: "_".to_string(),
        }
    }

    /// Compare patterns and subject ids ignoring case (default `true`).
    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    /// Delimiter splitting the subject id off the file stem (default `"_"`).
    pub fn id_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.id_delimiter = delimiter.into();
        self
    }

    /// Recursively list files under the base directory whose name contains
    /// any of `patterns`, optionally restricted to an extension suffix.
    ///
    /// The result is sorted so that downstream tie-breaks are reproducible.
    /// An empty result is not an error.
    ///
    /// # Errors
    ///
    /// Returns `MatcherError::BaseDirNotFound` if the base directory does not
    /// exist, `MatcherError::Io` on directory traversal failures.
    pub fn collect_file_names(
        &self,
        patterns: &[&str],
        extension: Option<&str>,
    ) -> Result<Vec<PathBuf>, MatcherError> {
        if !self.base_dir.is_dir() {
            return Err(MatcherError::BaseDirNotFound(self.base_dir.clone()));
        }

        let extension = extension.map(|ext| {
            let ext = if ext.starts_with('.') {
                ext.to_string()
            } else {
                format!(".{ext}")
            };
            self.fold_case(&ext)
        });
        let patterns: Vec<String> = patterns.iter().map(|p| self.fold_case(p)).collect();

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.base_dir) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = self.fold_case(&entry.file_name().to_string_lossy());
            if !patterns.iter().any(|p| name.contains(p.as_str())) {
                continue;
            }
            if let Some(ref ext) = extension {
                if !name.ends_with(ext.as_str()) {
                    continue;
                }
            }
            files.push(entry.into_path());
        }

        files.sort();
        Ok(files)
    }

    /// Derive one subject id per file and seed a registry with the primary
    /// sequence entry for every discovered subject.
    ///
    /// Files whose derived id collides with an earlier file are collapsed
    /// into the same subject; the first file in listing order keeps the
    /// primary entry.
    ///
    /// # Errors
    ///
    /// Returns `MatcherError::AmbiguousId` if a file name yields no id.
    pub fn find_unique_ids(
        &self,
        file_list: &[PathBuf],
        primary_name: &str,
    ) -> Result<Registry, MatcherError> {
        let mut registry = Registry::default();
        for file in file_list {
            let id = self.derive_subject_id(file)?;
            let record = registry.entry(id.clone());
            if !record.contains(primary_name) {
                debug!(subject = %id, file = %file.display(), "seeding primary sequence");
                record.insert(primary_name, file.clone());
            }
        }
        Ok(registry)
    }

    /// Attach the best-matching file of `file_list` to every subject already
    /// in the registry, under `sequence_name`.
    ///
    /// A file is a candidate for a subject when its name contains the
    /// subject id. Among multiple candidates the one with the highest
    /// partial fuzzy ratio against the subject's primary file name wins;
    /// ties keep the first candidate in listing order. Subjects with no
    /// candidate are left untouched.
    pub fn match_list_to_unique_ids(
        &self,
        registry: &mut Registry,
        file_list: &[PathBuf],
        primary_name: &str,
        sequence_name: &str,
    ) {
        let ids: Vec<String> = registry.subject_ids().map(str::to_string).collect();
        for id in ids {
            let needle = self.fold_case(&id);
            let label = registry
                .record(&id)
                .and_then(|record| record.get(primary_name))
                .map(|path| path.to_string_lossy().into_owned());

            let mut best: Option<(&PathBuf, u32)> = None;
            for file in file_list {
                let name = self.fold_case(&file.file_name().unwrap_or_default().to_string_lossy());
                if !name.contains(needle.as_str()) {
                    continue;
                }
                let score = match label {
                    Some(ref label) => partial_ratio(&file.to_string_lossy(), label),
                    None => 0,
                };
                // strictly-greater keeps the first candidate on ties
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((file, score));
                }
            }

            if let Some((file, score)) = best {
                debug!(
                    subject = %id,
                    sequence = sequence_name,
                    file = %file.display(),
                    score,
                    "matched sequence"
                );
                if let Some(record) = registry.record_mut(&id) {
                    record.insert(sequence_name, file.clone());
                }
            }
        }
    }

    /// Leading token of the file stem, split on the configured delimiter.
    fn derive_subject_id(&self, file: &Path) -> Result<String, MatcherError> {
        let ambiguous = || MatcherError::AmbiguousId {
            file: file.to_path_buf(),
            delimiter: self.id_delimiter.clone(),
        };

        let stem = file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(ambiguous)?;
        let token = stem
            .split(self.id_delimiter.as_str())
            .next()
            .filter(|token| !token.is_empty())
            .ok_or_else(ambiguous)?;
        Ok(token.to_string())
    }

    fn fold_case(&self, s: &str) -> String {
        if self.case_insensitive {
            s.to_lowercase()
        } else {
            s.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap();
        path
    }

    fn cohort(names: &[&str]) -> (tempfile::TempDir, FileMatcher) {
        let dir = tempdir().unwrap();
        for name in names {
            touch(dir.path(), name);
        }
        let matcher = FileMatcher::new(dir.path());
        (dir, matcher)
    }

    #[test]
    fn collect_requires_existing_base_dir() {
        let matcher = FileMatcher::new("/no/such/cohort/dir");
        assert!(matches!(
            matcher.collect_file_names(&["ART"], None),
            Err(MatcherError::BaseDirNotFound(_))
        ));
    }

    #[test]
    fn collect_filters_by_pattern_and_extension() {
        let (_dir, matcher) =
            cohort(&["P1_ART.nii", "P1_VEN.nii", "P2_ART.nii", "P2_ART.json", "notes.txt"]);

        let files = matcher.collect_file_names(&["ART"], Some(".nii")).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["P1_ART.nii", "P2_ART.nii"]);
    }

    #[test]
    fn collect_accepts_logical_or_of_patterns() {
        let (_dir, matcher) = cohort(&["P1_ART.nii", "P1_VEN.nii", "P2_DWI.nii"]);
        let files = matcher
            .collect_file_names(&["ART", "VEN"], Some(".nii"))
            .unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn collect_recurses_into_subdirectories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("batch1")).unwrap();
        touch(&dir.path().join("batch1"), "P7_ART.nii");
        let matcher = FileMatcher::new(dir.path());
        let files = matcher.collect_file_names(&["ART"], None).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn collect_with_no_matches_is_empty_not_error() {
        let (_dir, matcher) = cohort(&["P1_ART.nii"]);
        let files = matcher.collect_file_names(&["XYZ"], None).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn find_unique_ids_seeds_primary_for_every_subject() {
        let (_dir, matcher) = cohort(&["P1_ART.nii", "P2_ART.nii", "P3_ART.nii"]);
        let files = matcher.collect_file_names(&["ART"], None).unwrap();
        let registry = matcher.find_unique_ids(&files, "arterial").unwrap();

        assert_eq!(registry.len(), 3);
        for (_, record) in registry.iter() {
            assert!(record.contains("arterial"));
        }
    }

    #[test]
    fn duplicate_ids_collapse_keeping_first_file() {
        let (_dir, matcher) = cohort(&["P1_ART.nii", "P1_ART_repeat.nii"]);
        let files = matcher.collect_file_names(&["ART"], None).unwrap();
        let registry = matcher.find_unique_ids(&files, "arterial").unwrap();

        assert_eq!(registry.len(), 1);
        let primary = registry.record("P1").unwrap().get("arterial").unwrap();
        assert_eq!(primary.file_name().unwrap(), "P1_ART.nii");
    }

    #[test]
    fn hidden_stem_yields_ambiguous_id() {
        let (_dir, matcher) = cohort(&["_ART.nii"]);
        let files = matcher.collect_file_names(&["ART"], None).unwrap();
        assert!(matches!(
            matcher.find_unique_ids(&files, "arterial"),
            Err(MatcherError::AmbiguousId { .. })
        ));
    }

    #[test]
    fn match_attaches_sequence_and_skips_subjects_without_candidates() {
        let (_dir, matcher) = cohort(&["P1_ART.nii", "P1_VEN.nii", "P2_ART.nii"]);
        let art = matcher.collect_file_names(&["ART"], None).unwrap();
        let ven = matcher.collect_file_names(&["VEN"], None).unwrap();

        let mut registry = matcher.find_unique_ids(&art, "arterial").unwrap();
        matcher.match_list_to_unique_ids(&mut registry, &ven, "arterial", "venous");

        assert_eq!(registry.len(), 2);
        assert!(registry.record("P1").unwrap().contains("venous"));
        assert!(!registry.record("P2").unwrap().contains("venous"));
    }

    #[test]
    fn fuzzy_score_picks_candidate_closest_to_primary() {
        let (_dir, matcher) = cohort(&["P1_ART.nii", "P1_ART2.nii", "P1_VEN.nii"]);
        let art = matcher.collect_file_names(&["ART"], None).unwrap();
        let mut registry = matcher.find_unique_ids(&art, "arterial").unwrap();

        let candidates = matcher
            .collect_file_names(&["ART2", "VEN"], None)
            .unwrap();
        matcher.match_list_to_unique_ids(&mut registry, &candidates, "arterial", "derived");

        let chosen = registry.record("P1").unwrap().get("derived").unwrap();
        assert_eq!(chosen.file_name().unwrap(), "P1_ART2.nii");
    }

    #[test]
    fn tied_scores_keep_first_candidate_in_listing_order() {
        let (_dir, matcher) = cohort(&["P1_ART.nii", "P1_VENa.nii", "P1_VENb.nii"]);
        let art = matcher.collect_file_names(&["ART"], None).unwrap();
        let ven = matcher.collect_file_names(&["VEN"], None).unwrap();

        // both candidates really do score identically against the primary
        let label = art[0].to_string_lossy();
        let score_a = crate::similarity::partial_ratio(&ven[0].to_string_lossy(), &label);
        let score_b = crate::similarity::partial_ratio(&ven[1].to_string_lossy(), &label);
        assert_eq!(score_a, score_b);

        let mut registry = matcher.find_unique_ids(&art, "arterial").unwrap();
        matcher.match_list_to_unique_ids(&mut registry, &ven, "arterial", "venous");

        let chosen = registry.record("P1").unwrap().get("venous").unwrap();
        assert_eq!(chosen.file_name().unwrap(), "P1_VENa.nii");
    }

    #[test]
    fn matching_is_deterministic_across_runs() {
        let (_dir, matcher) = cohort(&["P1_ART.nii", "P1_VENa.nii", "P1_VENb.nii", "P2_ART.nii"]);
        let art = matcher.collect_file_names(&["ART"], None).unwrap();
        let ven = matcher.collect_file_names(&["VEN"], None).unwrap();

        let mut first = matcher.find_unique_ids(&art, "arterial").unwrap();
        matcher.match_list_to_unique_ids(&mut first, &ven, "arterial", "venous");
        let mut second = matcher.find_unique_ids(&art, "arterial").unwrap();
        matcher.match_list_to_unique_ids(&mut second, &ven, "arterial", "venous");

        assert_eq!(
            first.record("P1").unwrap().get("venous"),
            second.record("P1").unwrap().get("venous"),
        );
    }

    #[test]
    fn case_sensitive_matching_can_be_requested() {
        let (dir, _) = cohort(&["P1_art.nii"]);
        let matcher = FileMatcher::new(dir.path()).case_insensitive(false);
        let files = matcher.collect_file_names(&["ART"], None).unwrap();
        assert!(files.is_empty());
    }
}
