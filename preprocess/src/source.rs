//! The source layers tiles are sampled from.
//!
//! Elevation layers are either regular grids or triangulated irregular networks (TIN).
//! Both, like imagery layers, only answer point queries, so any other kind of source can
//! be plugged in by implementing [`ElevationSource`] or [`ImagerySource`].

use crate::{
    plan::LayerFootprint,
    result::{PreprocessError, PreprocessResult},
};
use glam::{DVec2, DVec3, UVec2};
use itertools::{iproduct, Itertools};
use ndarray::Array2;
use std::path::Path;
use terrain_pyramid::{math::WorldArea, terrain_data::INVALID_HEIGHT};

/// A layer of height samples.
pub trait ElevationSource: Send + Sync {
    fn extent(&self) -> WorldArea;

    /// The distance between neighbouring samples along both axes.
    fn native_spacing(&self) -> DVec2;

    /// The height at a world position, if the layer has data there.
    fn height_at(&self, point: DVec2) -> Option<f32>;

    /// The lowest and highest height of the layer, if known.
    fn height_range(&self) -> Option<(f32, f32)>;
}

/// A layer of color samples.
pub trait ImagerySource: Send + Sync {
    fn extent(&self) -> WorldArea;

    fn native_spacing(&self) -> DVec2;

    /// The color at a world position, if the layer has data there.
    fn color_at(&self, point: DVec2) -> Option<[u8; 4]>;
}

/// Every layer a pyramid is built from, in input order.
/// Later layers are drawn on top of earlier ones.
pub enum SourceLayerSet {
    Elevation(Vec<Box<dyn ElevationSource>>),
    Imagery(Vec<Box<dyn ImagerySource>>),
}

impl SourceLayerSet {
    pub fn len(&self) -> usize {
        match self {
            SourceLayerSet::Elevation(layers) => layers.len(),
            SourceLayerSet::Imagery(layers) => layers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_elevation(&self) -> bool {
        matches!(self, SourceLayerSet::Elevation(_))
    }

    pub(crate) fn footprints(&self) -> Vec<LayerFootprint> {
        match self {
            SourceLayerSet::Elevation(layers) => layers
                .iter()
                .map(|layer| LayerFootprint::new(layer.extent(), layer.native_spacing()))
                .collect(),
            SourceLayerSet::Imagery(layers) => layers
                .iter()
                .map(|layer| LayerFootprint::new(layer.extent(), layer.native_spacing()))
                .collect(),
        }
    }

    /// The smallest area containing every layer.
    pub fn extent(&self) -> Option<WorldArea> {
        self.footprints()
            .into_iter()
            .map(|footprint| footprint.extent)
            .reduce(|a, b| WorldArea {
                left: a.left.min(b.left),
                bottom: a.bottom.min(b.bottom),
                right: a.right.max(b.right),
                top: a.top.max(b.top),
            })
    }

    /// The combined height range of all elevation layers that report one.
    pub(crate) fn height_range(&self) -> Option<(f32, f32)> {
        let SourceLayerSet::Elevation(layers) = self else {
            return None;
        };

        layers
            .iter()
            .filter_map(|layer| layer.height_range())
            .reduce(|(min, max), (low, high)| (min.min(low), max.max(high)))
    }
}

/// A regular grid of height samples, where the outermost samples lie on the border of the
/// extent (pixel is point).
#[derive(Clone, Debug)]
pub struct ElevationGrid {
    area: WorldArea,
    /// Indexed by `[row, column]`, row 0 is the northern edge.
    heights: Array2<f32>,
    range: Option<(f32, f32)>,
}

impl ElevationGrid {
    /// Samples equal to [`INVALID_HEIGHT`] mark missing data.
    pub fn new(area: WorldArea, heights: Array2<f32>) -> PreprocessResult<Self> {
        let (rows, columns) = heights.dim();

        if rows < 2 || columns < 2 {
            return Err(PreprocessError::SourceData(format!(
                "an elevation grid needs at least 2x2 samples, found {columns}x{rows}"
            )));
        }

        let range = heights
            .iter()
            .filter(|&&height| height != INVALID_HEIGHT)
            .minmax()
            .into_option()
            .map(|(&min, &max)| (min, max));

        Ok(Self {
            area,
            heights,
            range,
        })
    }

    /// Creates a grid of `size` samples by evaluating `height` at every sample position.
    pub fn from_fn(
        area: WorldArea,
        size: UVec2,
        height: impl Fn(DVec2) -> Option<f32>,
    ) -> PreprocessResult<Self> {
        let spacing = area.size() / (size.as_dvec2() - 1.0);

        let heights = Array2::from_shape_fn((size.y as usize, size.x as usize), |(row, column)| {
            let point = DVec2::new(
                area.left + column as f64 * spacing.x,
                area.top - row as f64 * spacing.y,
            );
            height(point).unwrap_or(INVALID_HEIGHT)
        });

        Self::new(area, heights)
    }

    /// Loads a grayscale image, where each sample is `value * height_scale + height_offset`.
    pub fn load_file<P: AsRef<Path>>(
        path: P,
        area: WorldArea,
        height_scale: f32,
        height_offset: f32,
        no_data: Option<u16>,
    ) -> PreprocessResult<Self> {
        let image = image::open(path)?.to_luma16();
        let (width, height) = image.dimensions();

        let heights = image
            .into_raw()
            .into_iter()
            .map(|value| {
                if Some(value) == no_data {
                    INVALID_HEIGHT
                } else {
                    value as f32 * height_scale + height_offset
                }
            })
            .collect();

        let heights = Array2::from_shape_vec((height as usize, width as usize), heights)
            .map_err(|error| PreprocessError::SourceData(error.to_string()))?;

        Self::new(area, heights)
    }

    fn sample(&self, column: usize, row: usize) -> Option<f32> {
        self.heights
            .get((row, column))
            .copied()
            .filter(|&height| height != INVALID_HEIGHT)
    }
}

impl ElevationSource for ElevationGrid {
    fn extent(&self) -> WorldArea {
        self.area
    }

    fn native_spacing(&self) -> DVec2 {
        let (rows, columns) = self.heights.dim();
        self.area.size() / DVec2::new((columns - 1) as f64, (rows - 1) as f64)
    }

    /// Interpolates bilinearly between the four surrounding samples.
    /// Next to missing samples the nearest sample is used instead.
    fn height_at(&self, point: DVec2) -> Option<f32> {
        if !self.area.contains(point) {
            return None;
        }

        let (rows, columns) = self.heights.dim();
        let cells = DVec2::new((columns - 1) as f64, (rows - 1) as f64);
        let uv = DVec2::new(
            (point.x - self.area.left) / self.area.width(),
            (self.area.top - point.y) / self.area.height(),
        ) * cells;

        let origin = uv.floor().min(cells - 1.0).max(DVec2::ZERO);
        let fraction = (uv - origin).as_vec2();
        let (x, y) = (origin.x as usize, origin.y as usize);

        match (
            self.sample(x, y),
            self.sample(x + 1, y),
            self.sample(x, y + 1),
            self.sample(x + 1, y + 1),
        ) {
            (Some(h00), Some(h10), Some(h01), Some(h11)) => {
                let top = h00 + (h10 - h00) * fraction.x;
                let bottom = h01 + (h11 - h01) * fraction.x;
                Some(top + (bottom - top) * fraction.y)
            }
            _ => {
                let nearest = uv.round();
                self.sample(nearest.x as usize, nearest.y as usize)
            }
        }
    }

    fn height_range(&self) -> Option<(f32, f32)> {
        self.range
    }
}

/// A triangulated irregular network.
///
/// Triangles are looked up through a coarse grid of buckets that stores every triangle
/// in each bucket its bounding box touches.
#[derive(Clone, Debug)]
pub struct Tin {
    area: WorldArea,
    vertices: Vec<DVec3>,
    triangles: Vec<[u32; 3]>,
    bucket_count: UVec2,
    buckets: Vec<Vec<u32>>,
    spacing: f64,
}

impl Tin {
    pub fn new(vertices: Vec<DVec3>, triangles: Vec<[u32; 3]>) -> PreprocessResult<Self> {
        if triangles.is_empty() {
            return Err(PreprocessError::SourceData("a TIN needs at least one triangle".into()));
        }

        if let Some(index) = triangles.iter().flatten().find(|&&index| index as usize >= vertices.len()) {
            return Err(PreprocessError::SourceData(format!(
                "triangle vertex {index} does not exist"
            )));
        }

        let (min, max) = vertices.iter().fold(
            (DVec2::splat(f64::INFINITY), DVec2::splat(f64::NEG_INFINITY)),
            |(min, max), vertex| (min.min(vertex.truncate()), max.max(vertex.truncate())),
        );
        let area = WorldArea::from_corners(min, max)
            .map_err(|error| PreprocessError::SourceData(error.to_string()))?;

        let edge_count = triangles.len() * 3;
        let spacing = triangles
            .iter()
            .flat_map(|&[a, b, c]| [(a, b), (b, c), (c, a)])
            .map(|(a, b)| {
                (vertices[a as usize].truncate() - vertices[b as usize].truncate()).length()
            })
            .sum::<f64>()
            / edge_count as f64;

        let side = (triangles.len() as f64).sqrt().ceil().max(1.0) as u32;
        let bucket_count = UVec2::splat(side);

        let mut tin = Self {
            area,
            vertices,
            triangles,
            bucket_count,
            buckets: vec![Vec::new(); (side * side) as usize],
            spacing,
        };

        for index in 0..tin.triangles.len() {
            let corners = tin.corners(index);
            let (min, max) = corners.iter().fold(
                (DVec2::splat(f64::INFINITY), DVec2::splat(f64::NEG_INFINITY)),
                |(min, max), corner| (min.min(corner.truncate()), max.max(corner.truncate())),
            );

            let start = tin.bucket(min);
            let end = tin.bucket(max);

            for (x, y) in iproduct!(start.x..=end.x, start.y..=end.y) {
                tin.buckets[(y * side + x) as usize].push(index as u32);
            }
        }

        Ok(tin)
    }

    fn corners(&self, triangle: usize) -> [DVec3; 3] {
        self.triangles[triangle].map(|index| self.vertices[index as usize])
    }

    fn bucket(&self, point: DVec2) -> UVec2 {
        let uv = (point - self.area.min()) / self.area.size();
        (uv * self.bucket_count.as_dvec2())
            .as_uvec2()
            .min(self.bucket_count - 1)
    }
}

fn barycentric(point: DVec2, [a, b, c]: [DVec3; 3]) -> Option<DVec3> {
    let (a, b, c) = (a.truncate(), b.truncate(), c.truncate());
    let denominator = (b.y - c.y) * (a.x - c.x) + (c.x - b.x) * (a.y - c.y);

    if denominator.abs() < f64::EPSILON {
        return None;
    }

    let u = ((b.y - c.y) * (point.x - c.x) + (c.x - b.x) * (point.y - c.y)) / denominator;
    let v = ((c.y - a.y) * (point.x - c.x) + (a.x - c.x) * (point.y - c.y)) / denominator;
    let w = 1.0 - u - v;

    const TOLERANCE: f64 = -1e-9;
    (u >= TOLERANCE && v >= TOLERANCE && w >= TOLERANCE).then_some(DVec3::new(u, v, w))
}

impl ElevationSource for Tin {
    fn extent(&self) -> WorldArea {
        self.area
    }

    fn native_spacing(&self) -> DVec2 {
        DVec2::splat(self.spacing)
    }

    fn height_at(&self, point: DVec2) -> Option<f32> {
        if !self.area.contains(point) {
            return None;
        }

        let bucket = self.bucket(point);
        let triangles = &self.buckets[(bucket.y * self.bucket_count.x + bucket.x) as usize];

        triangles.iter().find_map(|&triangle| {
            let corners = self.corners(triangle as usize);
            let weights = barycentric(point, corners)?;

            Some((weights.x * corners[0].z + weights.y * corners[1].z + weights.z * corners[2].z) as f32)
        })
    }

    fn height_range(&self) -> Option<(f32, f32)> {
        self.vertices
            .iter()
            .map(|vertex| vertex.z as f32)
            .minmax()
            .into_option()
    }
}

/// The two kinds of elevation layers.
#[derive(Clone, Debug)]
pub enum SourceRaster {
    Grid(ElevationGrid),
    Tin(Tin),
}

impl ElevationSource for SourceRaster {
    fn extent(&self) -> WorldArea {
        match self {
            SourceRaster::Grid(grid) => grid.extent(),
            SourceRaster::Tin(tin) => tin.extent(),
        }
    }

    fn native_spacing(&self) -> DVec2 {
        match self {
            SourceRaster::Grid(grid) => grid.native_spacing(),
            SourceRaster::Tin(tin) => tin.native_spacing(),
        }
    }

    fn height_at(&self, point: DVec2) -> Option<f32> {
        match self {
            SourceRaster::Grid(grid) => grid.height_at(point),
            SourceRaster::Tin(tin) => tin.height_at(point),
        }
    }

    fn height_range(&self) -> Option<(f32, f32)> {
        match self {
            SourceRaster::Grid(grid) => grid.height_range(),
            SourceRaster::Tin(tin) => tin.height_range(),
        }
    }
}

/// An image covering an area, where every pixel covers a cell of the area (pixel is area).
/// Fully transparent pixels have no data.
#[derive(Clone, Debug)]
pub struct ImageryLayer {
    area: WorldArea,
    /// Indexed by `[row, column]`, row 0 is the northern edge.
    pixels: Array2<[u8; 4]>,
}

impl ImageryLayer {
    pub fn new(area: WorldArea, pixels: Array2<[u8; 4]>) -> PreprocessResult<Self> {
        if pixels.is_empty() {
            return Err(PreprocessError::SourceData("an imagery layer needs pixels".into()));
        }

        Ok(Self { area, pixels })
    }

    pub fn load_file<P: AsRef<Path>>(path: P, area: WorldArea) -> PreprocessResult<Self> {
        let image = image::open(path)?.to_rgba8();
        let (width, height) = image.dimensions();

        let pixels = image.pixels().map(|pixel| pixel.0).collect();
        let pixels = Array2::from_shape_vec((height as usize, width as usize), pixels)
            .map_err(|error| PreprocessError::SourceData(error.to_string()))?;

        Self::new(area, pixels)
    }
}

impl ImagerySource for ImageryLayer {
    fn extent(&self) -> WorldArea {
        self.area
    }

    fn native_spacing(&self) -> DVec2 {
        let (rows, columns) = self.pixels.dim();
        self.area.size() / DVec2::new(columns as f64, rows as f64)
    }

    fn color_at(&self, point: DVec2) -> Option<[u8; 4]> {
        if !self.area.contains(point) {
            return None;
        }

        let (rows, columns) = self.pixels.dim();
        let column = ((point.x - self.area.left) / self.native_spacing().x) as usize;
        let row = ((self.area.top - point.y) / self.native_spacing().y) as usize;

        self.pixels
            .get((row.min(rows - 1), column.min(columns - 1)))
            .copied()
            .filter(|pixel| pixel[3] != 0)
    }
}
