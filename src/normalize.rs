use thiserror::Error;

use crate::volume::Volume;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("cannot z-score a uniform image (zero standard deviation)")]
    DegenerateImage,

    #[error("cannot z-score an empty image")]
    EmptyImage,
}

// Uniform images have a mathematically zero variance; anything below this
// is rounding noise from the accumulation.
const MIN_STD: f64 = 1e-12;

/// Z-score normalize voxel intensities: `(value - mean) / std`.
///
/// Spatial metadata is preserved unchanged; only intensities change.
///
/// # Errors
///
/// Returns `NormalizeError::DegenerateImage` for uniform input instead of
/// propagating non-finite values.
pub fn zscore(volume: &Volume) -> Result<Volume, NormalizeError> {
    let data = volume.data();
    let count = data.len();
    if count == 0 {
        return Err(NormalizeError::EmptyImage);
    }

    let mut sum = 0.0f64;
    let mut sum_of_squares = 0.0f64;
    for &value in data.iter() {
        let value = value as f64;
        sum += value;
        sum_of_squares += value * value;
    }
    let mean = sum / count as f64;
    let variance = (sum_of_squares / count as f64 - mean * mean).max(0.0);
    let std = variance.sqrt();

    if std < MIN_STD {
        return Err(NormalizeError::DegenerateImage);
    }

    let mut normalized = data.clone();
    normalized.par_mapv_inplace(|value| ((value as f64 - mean) / std) as f32);

    Ok(Volume::new(
        normalized,
        volume.spacing(),
        volume.origin(),
        volume.direction(),
    ))
}
