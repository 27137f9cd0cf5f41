use ndarray::Array3;

/// Spatial grid of a volume: size, voxel spacing, origin and direction
/// cosines. Column `j` of `direction` is the unit vector of image axis `j`
/// in physical space.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub size: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub direction: [[f64; 3]; 3],
}

pub const IDENTITY_DIRECTION: [[f64; 3]; 3] =
    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

impl Geometry {
    pub fn new(
        size: [usize; 3],
        spacing: [f64; 3],
        origin: [f64; 3],
        direction: [[f64; 3]; 3],
    ) -> Self {
        Self {
            size,
            spacing,
            origin,
            direction,
        }
    }

    /// Map a (continuous) voxel index to a physical point.
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let scaled = [
            index[0] * self.spacing[0],
            index[1] * self.spacing[1],
            index[2] * self.spacing[2],
        ];
        let rotated = mat_vec(&self.direction, scaled);
        [
            rotated[0] + self.origin[0],
            rotated[1] + self.origin[1],
            rotated[2] + self.origin[2],
        ]
    }

    /// Map a physical point back to a continuous voxel index.
    ///
    /// Returns `None` if the direction matrix is singular.
    pub fn physical_to_index(&self, point: [f64; 3]) -> Option<[f64; 3]> {
        let inverse = mat_inverse(&self.direction)?;
        let shifted = [
            point[0] - self.origin[0],
            point[1] - self.origin[1],
            point[2] - self.origin[2],
        ];
        let rotated = mat_vec(&inverse, shifted);
        Some([
            rotated[0] / self.spacing[0],
            rotated[1] / self.spacing[1],
            rotated[2] / self.spacing[2],
        ])
    }

    /// Physical point at the continuous center of the grid.
    pub fn physical_center(&self) -> [f64; 3] {
        self.index_to_physical([
            self.size[0] as f64 / 2.0,
            self.size[1] as f64 / 2.0,
            self.size[2] as f64 / 2.0,
        ])
    }
}

/// A 3D image: voxel intensities plus the grid they live on.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<f32>,
    geometry: Geometry,
}

impl Volume {
    /// Build a volume from voxel data and spatial metadata. The grid size is
    /// taken from the array dimensions (x, y, z).
    pub fn new(
        data: Array3<f32>,
        spacing: [f64; 3],
        origin: [f64; 3],
        direction: [[f64; 3]; 3],
    ) -> Self {
        let (nx, ny, nz) = data.dim();
        Self {
            data,
            geometry: Geometry::new([nx, ny, nz], spacing, origin, direction),
        }
    }

    /// Get the dimensions of the volume (x, y, z)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.geometry.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.geometry.origin
    }

    pub fn direction(&self) -> [[f64; 3]; 3] {
        self.geometry.direction
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }
}

pub(crate) fn mat_vec(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Invert a 3x3 matrix, `None` if it is singular.
pub(crate) fn mat_inverse(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);

    if det.abs() < f64::EPSILON {
        return None;
    }

    let inv_det = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}
