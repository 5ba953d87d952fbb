//! Tile rasters and their bookkeeping.
//!
//! A tileset is a grid of `columns × rows` tiles, each stored at several levels of detail.
//! Every level of a tile is one [`TileRaster`], which is serialized into its own blob
//! (see [`formats`](crate::formats)).
//! The [`LodExistenceMap`](lod_map::LodExistenceMap) records which levels were generated
//! for each tile and the [`TileCache`](tile_cache::TileCache) streams them back in.

use crate::math::WorldArea;
use anyhow::{anyhow, ensure, Result};
use bytemuck::cast_slice;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

pub mod lod_map;
pub mod tile_cache;
pub mod tile_loader;

/// Marks a height sample without data.
pub const INVALID_HEIGHT: f32 = -99999.0;
/// Marks a scaled 16 bit height sample without data.
pub const INVALID_HEIGHT_I16: i16 = i16::MIN;

/// The storage of elevation samples.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SampleDepth {
    /// Signed 16 bit integers, multiplied by the vertical scale of the tileset.
    Int16Scaled,
    /// 32 bit floats in world units.
    #[default]
    Float32,
}

impl SampleDepth {
    /// The lowest and highest height in world units samples of this depth can hold.
    pub fn height_limits(self, vertical_scale: f32) -> (f32, f32) {
        match self {
            SampleDepth::Int16Scaled => (
                (INVALID_HEIGHT_I16 as f32 + 1.0) * vertical_scale,
                i16::MAX as f32 * vertical_scale,
            ),
            SampleDepth::Float32 => (f32::MIN, f32::MAX),
        }
    }
}

/// The data format of a tile.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TileFormat {
    /// One channel 16 bit scaled height
    R16Scaled,
    /// One channel 32 bit float height
    R32F,
    /// Three channels 8 bit
    Rgb8,
    /// Four channels 8 bit
    Rgba8,
}

impl TileFormat {
    pub(crate) fn id(self) -> u8 {
        match self {
            TileFormat::R16Scaled => 1,
            TileFormat::R32F => 2,
            TileFormat::Rgb8 => 3,
            TileFormat::Rgba8 => 4,
        }
    }

    pub(crate) fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(TileFormat::R16Scaled),
            2 => Some(TileFormat::R32F),
            3 => Some(TileFormat::Rgb8),
            4 => Some(TileFormat::Rgba8),
            _ => None,
        }
    }

    pub fn pixel_size(self) -> usize {
        match self {
            TileFormat::R16Scaled => 2,
            TileFormat::R32F => 4,
            TileFormat::Rgb8 => 3,
            TileFormat::Rgba8 => 4,
        }
    }

    /// The number of bytes of a `width × height` raster, unless it overflows.
    pub fn raster_bytes(self, width: usize, height: usize) -> Option<usize> {
        width.checked_mul(height)?.checked_mul(self.pixel_size())
    }

    pub fn is_elevation(self) -> bool {
        matches!(self, TileFormat::R16Scaled | TileFormat::R32F)
    }

    /// The edge length in samples of a tile with `tile_size` cells.
    /// Elevation tiles store vertices (shared with their neighbours), imagery tiles store pixels.
    pub fn raster_size(self, tile_size: u32) -> u32 {
        if self.is_elevation() {
            tile_size + 1
        } else {
            tile_size
        }
    }
}

impl From<SampleDepth> for TileFormat {
    fn from(depth: SampleDepth) -> Self {
        match depth {
            SampleDepth::Int16Scaled => TileFormat::R16Scaled,
            SampleDepth::Float32 => TileFormat::R32F,
        }
    }
}

/// The samples of a tile, indexed by `[row, column]`.
#[derive(Clone, Debug, PartialEq)]
pub enum TileData {
    R16Scaled(Array2<i16>),
    R32F(Array2<f32>),
    Rgb8(Array2<[u8; 3]>),
    Rgba8(Array2<[u8; 4]>),
}

impl TileData {
    /// Converts heights in world units into the requested sample depth.
    /// Invalid heights map onto the invalid marker of that depth, heights beyond the
    /// [`height_limits`](SampleDepth::height_limits) are clamped.
    pub fn from_heights(heights: &Array2<f32>, depth: SampleDepth, vertical_scale: f32) -> Self {
        match depth {
            SampleDepth::Float32 => TileData::R32F(heights.clone()),
            SampleDepth::Int16Scaled => TileData::R16Scaled(heights.mapv(|height| {
                if height == INVALID_HEIGHT {
                    INVALID_HEIGHT_I16
                } else {
                    (height / vertical_scale)
                        .round()
                        .clamp(i16::MIN as f32 + 1.0, i16::MAX as f32) as i16
                }
            })),
        }
    }

    pub fn format(&self) -> TileFormat {
        match self {
            TileData::R16Scaled(_) => TileFormat::R16Scaled,
            TileData::R32F(_) => TileFormat::R32F,
            TileData::Rgb8(_) => TileFormat::Rgb8,
            TileData::Rgba8(_) => TileFormat::Rgba8,
        }
    }

    /// `(width, height)` in samples.
    pub fn size(&self) -> (usize, usize) {
        let (rows, columns) = match self {
            TileData::R16Scaled(data) => data.dim(),
            TileData::R32F(data) => data.dim(),
            TileData::Rgb8(data) => data.dim(),
            TileData::Rgba8(data) => data.dim(),
        };

        (columns, rows)
    }

    pub fn byte_size(&self) -> usize {
        let (width, height) = self.size();
        width * height * self.format().pixel_size()
    }

    /// The raw samples in row-major order, multi-byte values in little endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TileData::R16Scaled(data) => data.iter().flat_map(|value| value.to_le_bytes()).collect(),
            TileData::R32F(data) => data.iter().flat_map(|value| value.to_le_bytes()).collect(),
            TileData::Rgb8(data) => data.iter().flatten().copied().collect(),
            TileData::Rgba8(data) => data.iter().flatten().copied().collect(),
        }
    }

    pub fn from_bytes(format: TileFormat, width: usize, height: usize, bytes: &[u8]) -> Result<Self> {
        let expected = format
            .raster_bytes(width, height)
            .ok_or_else(|| anyhow!("a {width}x{height} {format:?} tile is too large"))?;
        ensure!(
            bytes.len() == expected,
            "expected {expected} bytes for a {width}x{height} {format:?} tile, found {}",
            bytes.len()
        );

        let shape = (height, width);

        Ok(match format {
            TileFormat::R16Scaled => TileData::R16Scaled(Array2::from_shape_vec(
                shape,
                bytes
                    .chunks_exact(2)
                    .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
                    .collect(),
            )?),
            TileFormat::R32F => TileData::R32F(Array2::from_shape_vec(
                shape,
                bytes
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect(),
            )?),
            TileFormat::Rgb8 => {
                TileData::Rgb8(Array2::from_shape_vec(shape, cast_slice(bytes).to_vec())?)
            }
            TileFormat::Rgba8 => {
                TileData::Rgba8(Array2::from_shape_vec(shape, cast_slice(bytes).to_vec())?)
            }
        })
    }

    /// Takes every `step`-th sample along both axes, starting at the first one.
    pub fn subsample(&self, step: usize) -> Self {
        match self {
            TileData::R16Scaled(data) => TileData::R16Scaled(data.slice(s![..;step, ..;step]).to_owned()),
            TileData::R32F(data) => TileData::R32F(data.slice(s![..;step, ..;step]).to_owned()),
            TileData::Rgb8(data) => TileData::Rgb8(data.slice(s![..;step, ..;step]).to_owned()),
            TileData::Rgba8(data) => TileData::Rgba8(data.slice(s![..;step, ..;step]).to_owned()),
        }
    }
}

/// One level of detail of one tile, together with the area it covers.
#[derive(Clone, Debug, PartialEq)]
pub struct TileRaster {
    pub area: WorldArea,
    pub vertical_scale: f32,
    pub data: TileData,
}

impl TileRaster {
    pub fn new(area: WorldArea, vertical_scale: f32, data: TileData) -> Self {
        Self {
            area,
            vertical_scale,
            data,
        }
    }

    pub fn format(&self) -> TileFormat {
        self.data.format()
    }

    pub fn size(&self) -> (usize, usize) {
        self.data.size()
    }

    pub fn byte_size(&self) -> usize {
        self.data.byte_size()
    }

    /// The height in world units of the vertex at `column`, `row`.
    pub fn height(&self, column: usize, row: usize) -> Option<f32> {
        match &self.data {
            TileData::R16Scaled(data) => data
                .get((row, column))
                .filter(|&&value| value != INVALID_HEIGHT_I16)
                .map(|&value| value as f32 * self.vertical_scale),
            TileData::R32F(data) => data
                .get((row, column))
                .filter(|&&value| value != INVALID_HEIGHT)
                .copied(),
            TileData::Rgb8(_) | TileData::Rgba8(_) => None,
        }
    }

    /// Bilinearly interpolated height at a world position inside the tile.
    pub fn interpolate_height(&self, point: glam::DVec2) -> Option<f32> {
        if !self.format().is_elevation() || !self.area.contains(point) {
            return None;
        }

        let (width, height) = self.size();
        let cells = glam::DVec2::new(width.checked_sub(1)? as f64, height.checked_sub(1)? as f64);
        let uv = glam::DVec2::new(
            (point.x - self.area.left) / self.area.width(),
            (self.area.top - point.y) / self.area.height(),
        ) * cells;

        let origin = uv.floor().min(cells - 1.0).max(glam::DVec2::ZERO);
        let fraction = (uv - origin).as_vec2();
        let (x, y) = (origin.x as usize, origin.y as usize);

        let h00 = self.height(x, y)?;
        let h10 = self.height(x + 1, y)?;
        let h01 = self.height(x, y + 1)?;
        let h11 = self.height(x + 1, y + 1)?;

        let top = h00 + (h10 - h00) * fraction.x;
        let bottom = h01 + (h11 - h01) * fraction.x;

        Some(top + (bottom - top) * fraction.y)
    }

    /// The color of the pixel covering a world position inside the tile.
    pub fn color(&self, point: glam::DVec2) -> Option<[u8; 4]> {
        let (width, height) = self.size();

        if width == 0 || height == 0 || !self.area.contains(point) {
            return None;
        }

        let x = (((point.x - self.area.left) / self.area.width()) * width as f64) as usize;
        let y = (((self.area.top - point.y) / self.area.height()) * height as f64) as usize;
        let index = (y.min(height - 1), x.min(width - 1));

        match &self.data {
            TileData::Rgb8(data) => data.get(index).map(|&[r, g, b]| [r, g, b, u8::MAX]),
            TileData::Rgba8(data) => data.get(index).copied(),
            TileData::R16Scaled(_) | TileData::R32F(_) => None,
        }
    }
}
