//! Resampling onto a target voxel spacing.
//!
//! The reference grid keeps the input origin and direction and floors the
//! per-axis size, `new_size = floor((old_spacing / new_spacing) * old_size)`.
//! Resampling anchors the transformed center of the input to the center of
//! the reference grid so content near the boundary is not silently cropped.

use ndarray::Array3;
use thiserror::Error;

use crate::enums::Interpolation;
use crate::volume::{mat_inverse, mat_vec, Geometry, Volume};

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("resample target has a zero-size axis: {size:?} for spacing {spacing:?}")]
    InvalidGeometry { size: [usize; 3], spacing: [f64; 3] },

    #[error("non-positive target spacing: {0:?}")]
    InvalidSpacing([f64; 3]),

    #[error("input direction matrix is singular")]
    SingularDirection,
}

/// Compute the reference grid for resampling `input` to `new_spacing`.
///
/// # Errors
///
/// Returns `ResampleError::InvalidGeometry` when flooring produces a
/// zero-size axis and `ResampleError::InvalidSpacing` for non-positive
/// target spacing.
pub fn reference_geometry(
    input: &Geometry,
    new_spacing: [f64; 3],
) -> Result<Geometry, ResampleError> {
    if new_spacing.iter().any(|&s| s <= 0.0) {
        return Err(ResampleError::InvalidSpacing(new_spacing));
    }

    let mut size = [0usize; 3];
    for axis in 0..3 {
        let scaled =
            (input.spacing[axis] / new_spacing[axis]) * input.size[axis] as f64;
        size[axis] = scaled.floor() as usize;
    }
    if size.iter().any(|&n| n == 0) {
        return Err(ResampleError::InvalidGeometry {
            size,
            spacing: new_spacing,
        });
    }

    Ok(Geometry::new(size, new_spacing, input.origin, input.direction))
}

/// Resample a volume to a new voxel spacing.
pub fn resample_to_spacing(
    volume: &Volume,
    new_spacing: [f64; 3],
    interpolation: Interpolation,
) -> Result<Volume, ResampleError> {
    let reference = reference_geometry(volume.geometry(), new_spacing)?;
    resample_into(volume, &reference, interpolation)
}

/// Resample a volume onto an explicit reference grid, background fill 0.0.
///
/// The mapping from reference space to input space is the affine implied by
/// the input direction and the origin difference, composed with a
/// translation that aligns the two image centers.
pub fn resample_into(
    volume: &Volume,
    reference: &Geometry,
    interpolation: Interpolation,
) -> Result<Volume, ResampleError> {
    if reference.size.iter().any(|&n| n == 0) {
        return Err(ResampleError::InvalidGeometry {
            size: reference.size,
            spacing: reference.spacing,
        });
    }

    let input = volume.geometry();
    if input.size.iter().any(|&n| n == 0) {
        return Err(ResampleError::InvalidGeometry {
            size: input.size,
            spacing: input.spacing,
        });
    }
    let direction_inverse =
        mat_inverse(&input.direction).ok_or(ResampleError::SingularDirection)?;

    // affine A(p) = D * p + (origin_in - origin_ref)
    let translation = [
        input.origin[0] - reference.origin[0],
        input.origin[1] - reference.origin[1],
        input.origin[2] - reference.origin[2],
    ];

    // centering offset: A^-1(center_in) - center_ref
    let input_center = input.physical_center();
    let reference_center = reference.physical_center();
    let unshifted = [
        input_center[0] - translation[0],
        input_center[1] - translation[1],
        input_center[2] - translation[2],
    ];
    let rotated = mat_vec(&direction_inverse, unshifted);
    let offset = [
        rotated[0] - reference_center[0],
        rotated[1] - reference_center[1],
        rotated[2] - reference_center[2],
    ];

    let data = volume.data();
    let shape = (reference.size[0], reference.size[1], reference.size[2]);
    let resampled = Array3::from_shape_fn(shape, |(x, y, z)| {
        let point = reference.index_to_physical([x as f64, y as f64, z as f64]);
        let shifted = [
            point[0] + offset[0],
            point[1] + offset[1],
            point[2] + offset[2],
        ];
        let rotated = mat_vec(&input.direction, shifted);
        let mapped = [
            rotated[0] + translation[0],
            rotated[1] + translation[1],
            rotated[2] + translation[2],
        ];
        match input.physical_to_index(mapped) {
            Some(index) => sample(data, index, interpolation),
            None => 0.0,
        }
    });

    Ok(Volume::new(
        resampled,
        reference.spacing,
        reference.origin,
        reference.direction,
    ))
}

fn sample(data: &Array3<f32>, index: [f64; 3], interpolation: Interpolation) -> f32 {
    let (nx, ny, nz) = data.dim();
    let bounds = [nx as f64, ny as f64, nz as f64];
    // half a voxel of slack at each border, background beyond it
    if index
        .iter()
        .zip(bounds.iter())
        .any(|(&i, &n)| i < -0.5 || i > n - 0.5)
    {
        return 0.0;
    }

    match interpolation {
        Interpolation::NearestNeighbor => {
            let x = (index[0].round().max(0.0) as usize).min(nx - 1);
            let y = (index[1].round().max(0.0) as usize).min(ny - 1);
            let z = (index[2].round().max(0.0) as usize).min(nz - 1);
            data[[x, y, z]]
        }
        Interpolation::Trilinear => trilinear_interpolate(data, index),
    }
}

fn trilinear_interpolate(data: &Array3<f32>, index: [f64; 3]) -> f32 {
    let (nx, ny, nz) = data.dim();
    let x = index[0].clamp(0.0, (nx - 1) as f64);
    let y = index[1].clamp(0.0, (ny - 1) as f64);
    let z = index[2].clamp(0.0, (nz - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let z0 = z.floor() as usize;
    let x1 = (x0 + 1).min(nx - 1);
    let y1 = (y0 + 1).min(ny - 1);
    let z1 = (z0 + 1).min(nz - 1);

    let dx = (x - x0 as f64) as f32;
    let dy = (y - y0 as f64) as f32;
    let dz = (z - z0 as f64) as f32;
    let one_minus_dx = 1.0 - dx;
    let one_minus_dy = 1.0 - dy;
    let one_minus_dz = 1.0 - dz;

    let c00 = data[[x0, y0, z0]].mul_add(one_minus_dx, data[[x1, y0, z0]] * dx);
    let c01 = data[[x0, y0, z1]].mul_add(one_minus_dx, data[[x1, y0, z1]] * dx);
    let c10 = data[[x0, y1, z0]].mul_add(one_minus_dx, data[[x1, y1, z0]] * dx);
    let c11 = data[[x0, y1, z1]].mul_add(one_minus_dx, data[[x1, y1, z1]] * dx);

    let c0 = c00.mul_add(one_minus_dy, c10 * dy);
    let c1 = c01.mul_add(one_minus_dy, c11 * dy);

    c0.mul_add(one_minus_dz, c1 * dz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::IDENTITY_DIRECTION;
    use ndarray::Array3;

    fn unit_volume(shape: (usize, usize, usize), spacing: [f64; 3]) -> Volume {
        Volume::new(
            Array3::from_elem(shape, 1.0),
            spacing,
            [0.0, 0.0, 0.0],
            IDENTITY_DIRECTION,
        )
    }

    #[test]
    fn reference_size_uses_floor_rule() {
        let input = Geometry::new(
            [100, 100, 50],
            [1.0, 1.0, 2.0],
            [0.0, 0.0, 0.0],
            IDENTITY_DIRECTION,
        );
        let reference = reference_geometry(&input, [2.0, 2.0, 2.0]).unwrap();
        assert_eq!(reference.size, [50, 50, 50]);
        assert_eq!(reference.spacing, [2.0, 2.0, 2.0]);
        assert_eq!(reference.origin, input.origin);
        assert_eq!(reference.direction, input.direction);
    }

    #[test]
    fn reference_size_floors_rather_than_rounds() {
        let input = Geometry::new(
            [99, 99, 99],
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0],
            IDENTITY_DIRECTION,
        );
        let reference = reference_geometry(&input, [2.0, 2.0, 2.0]).unwrap();
        assert_eq!(reference.size, [49, 49, 49]);
    }

    #[test]
    fn oversized_target_spacing_is_invalid_geometry() {
        let input = Geometry::new(
            [100, 100, 50],
            [1.0, 1.0, 2.0],
            [0.0, 0.0, 0.0],
            IDENTITY_DIRECTION,
        );
        assert!(matches!(
            reference_geometry(&input, [1.0, 1.0, 200.0]),
            Err(ResampleError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn non_positive_spacing_is_rejected() {
        let input = Geometry::new(
            [10, 10, 10],
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0],
            IDENTITY_DIRECTION,
        );
        assert!(matches!(
            reference_geometry(&input, [0.0, 1.0, 1.0]),
            Err(ResampleError::InvalidSpacing(_))
        ));
    }

    #[test]
    fn empty_input_volume_is_rejected_not_sampled() {
        let volume = Volume::new(
            Array3::zeros((0, 4, 4)),
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0],
            IDENTITY_DIRECTION,
        );
        let reference = Geometry::new(
            [2, 2, 2],
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0],
            IDENTITY_DIRECTION,
        );
        assert!(matches!(
            resample_into(&volume, &reference, Interpolation::Trilinear),
            Err(ResampleError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn downsampling_a_uniform_volume_stays_uniform() {
        let volume = unit_volume((100, 100, 50), [1.0, 1.0, 2.0]);
        let resampled =
            resample_to_spacing(&volume, [2.0, 2.0, 2.0], Interpolation::Trilinear).unwrap();

        assert_eq!(resampled.dim(), (50, 50, 50));
        assert_eq!(resampled.spacing(), [2.0, 2.0, 2.0]);
        assert_eq!(resampled.origin(), volume.origin());
        assert!(resampled.data().iter().all(|&v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn identity_resample_preserves_values() {
        let data = Array3::from_shape_fn((8, 8, 8), |(x, y, z)| (x + y + z) as f32);
        let volume = Volume::new(
            data.clone(),
            [1.0, 1.0, 1.0],
            [5.0, -2.0, 1.0],
            IDENTITY_DIRECTION,
        );
        let resampled =
            resample_to_spacing(&volume, [1.0, 1.0, 1.0], Interpolation::Trilinear).unwrap();

        assert_eq!(resampled.dim(), (8, 8, 8));
        for (expected, actual) in data.iter().zip(resampled.data().iter()) {
            assert!((expected - actual).abs() < 1e-4);
        }
    }

    #[test]
    fn nearest_neighbor_keeps_original_intensities() {
        let data = Array3::from_shape_fn((6, 6, 6), |(x, _, _)| x as f32);
        let volume = Volume::new(data, [1.0, 1.0, 1.0], [0.0, 0.0, 0.0], IDENTITY_DIRECTION);
        let resampled =
            resample_to_spacing(&volume, [2.0, 2.0, 2.0], Interpolation::NearestNeighbor)
                .unwrap();

        assert_eq!(resampled.dim(), (3, 3, 3));
        for &value in resampled.data().iter() {
            assert_eq!(value, value.round());
        }
    }
}
