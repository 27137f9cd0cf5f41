use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayD, Axis, Ix3};
use nifti::{IntoNdArray, NiftiError, NiftiHeader, NiftiObject, ReaderOptions};
use nifti::writer::WriterOptions;
use thiserror::Error;

use crate::volume::{Geometry, Volume, IDENTITY_DIRECTION};

#[derive(Debug, Error)]
pub enum VolumeIoError {
    #[error("expected a 3D volume, got {0} dimensions")]
    UnsupportedDimensionality(usize),

    #[error("non-positive voxel spacing in header of {0}")]
    InvalidSpacing(PathBuf),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] NiftiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct VolumeIo;

impl VolumeIo {
    /// Read a NIfTI file into a [`Volume`].
    ///
    /// Geometry comes from the sform affine when present, otherwise from
    /// `pixdim` with identity direction. Trailing singleton dimensions are
    /// squeezed so that thin 4D exports still load.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be decoded, is not 3D, or
    /// carries a degenerate spacing.
    pub fn read(path: impl AsRef<Path>) -> Result<Volume, VolumeIoError> {
        let path = path.as_ref();
        let object = ReaderOptions::new().read_file(path)?;
        let geometry = Self::geometry_from_header(object.header(), path)?;

        let mut array: ArrayD<f32> = object.into_volume().into_ndarray::<f32>()?;
        while array.ndim() > 3 && array.len_of(Axis(array.ndim() - 1)) == 1 {
            let last = array.ndim() - 1;
            array = array.index_axis_move(Axis(last), 0);
        }
        let ndim = array.ndim();
        let data: Array3<f32> = array
            .into_dimensionality::<Ix3>()
            .map_err(|_| VolumeIoError::UnsupportedDimensionality(ndim))?;

        Ok(Volume::new(
            data,
            geometry.spacing,
            geometry.origin,
            geometry.direction,
        ))
    }

    /// Write a [`Volume`] as NIfTI, encoding its geometry in the sform.
    pub fn write(volume: &Volume, path: impl AsRef<Path>) -> Result<(), VolumeIoError> {
        let header = Self::header_from_geometry(volume.geometry());
        WriterOptions::new(path.as_ref())
            .reference_header(&header)
            .write_nifti(volume.data())?;
        Ok(())
    }

    fn geometry_from_header(
        header: &NiftiHeader,
        path: &Path,
    ) -> Result<Geometry, VolumeIoError> {
        let ndim = header.dim[0] as usize;
        if ndim < 3 {
            return Err(VolumeIoError::UnsupportedDimensionality(ndim));
        }
        let size = [
            header.dim[1] as usize,
            header.dim[2] as usize,
            header.dim[3] as usize,
        ];

        if header.sform_code > 0 {
            let rows = [header.srow_x, header.srow_y, header.srow_z];
            let mut spacing = [0.0f64; 3];
            let mut direction = IDENTITY_DIRECTION;
            for axis in 0..3 {
                let column = [
                    rows[0][axis] as f64,
                    rows[1][axis] as f64,
                    rows[2][axis] as f64,
                ];
                let norm = (column[0] * column[0]
                    + column[1] * column[1]
                    + column[2] * column[2])
                    .sqrt();
                if norm <= 0.0 {
                    return Err(VolumeIoError::InvalidSpacing(path.to_path_buf()));
                }
                spacing[axis] = norm;
                for row in 0..3 {
                    direction[row][axis] = column[row] / norm;
                }
            }
            let origin = [
                header.srow_x[3] as f64,
                header.srow_y[3] as f64,
                header.srow_z[3] as f64,
            ];
            Ok(Geometry::new(size, spacing, origin, direction))
        } else {
            let spacing = [
                header.pixdim[1] as f64,
                header.pixdim[2] as f64,
                header.pixdim[3] as f64,
            ];
            if spacing.iter().any(|&s| s <= 0.0) {
                return Err(VolumeIoError::InvalidSpacing(path.to_path_buf()));
            }
            Ok(Geometry::new(
                size,
                spacing,
                [0.0, 0.0, 0.0],
                IDENTITY_DIRECTION,
            ))
        }
    }

    fn header_from_geometry(geometry: &Geometry) -> NiftiHeader {
        let mut header = NiftiHeader::default();
        header.pixdim = [
            1.0,
            geometry.spacing[0] as f32,
            geometry.spacing[1] as f32,
            geometry.spacing[2] as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ];
        let rows = &geometry.direction;
        header.srow_x = [
            (rows[0][0] * geometry.spacing[0]) as f32,
            (rows[0][1] * geometry.spacing[1]) as f32,
            (rows[0][2] * geometry.spacing[2]) as f32,
            geometry.origin[0] as f32,
        ];
        header.srow_y = [
            (rows[1][0] * geometry.spacing[0]) as f32,
            (rows[1][1] * geometry.spacing[1]) as f32,
            (rows[1][2] * geometry.spacing[2]) as f32,
            geometry.origin[1] as f32,
        ];
        header.srow_z = [
            (rows[2][0] * geometry.spacing[0]) as f32,
            (rows[2][1] * geometry.spacing[1]) as f32,
            (rows[2][2] * geometry.spacing[2]) as f32,
            geometry.origin[2] as f32,
        ];
        header.sform_code = 1;
        header.qform_code = 0;
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        header
    }
}
