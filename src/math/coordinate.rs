use anyhow::{ensure, Result};
use derive_more::Display;
use glam::{DVec2, UVec2};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An axis-aligned rectangle in the coordinate reference system of a dataset.
///
/// The area is never empty: `left < right` and `bottom < top` always hold.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
#[serde(try_from = "RawWorldArea")]
pub struct WorldArea {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

#[derive(Deserialize)]
struct RawWorldArea {
    left: f64,
    bottom: f64,
    right: f64,
    top: f64,
}

impl TryFrom<RawWorldArea> for WorldArea {
    type Error = anyhow::Error;

    fn try_from(raw: RawWorldArea) -> Result<Self> {
        WorldArea::new(raw.left, raw.bottom, raw.right, raw.top)
    }
}

impl WorldArea {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Result<Self> {
        ensure!(
            left < right && bottom < top,
            "world area [{left}, {bottom}] - [{right}, {top}] is empty"
        );

        Ok(Self {
            left,
            bottom,
            right,
            top,
        })
    }

    pub fn from_corners(min: DVec2, max: DVec2) -> Result<Self> {
        Self::new(min.x, min.y, max.x, max.y)
    }

    pub fn min(&self) -> DVec2 {
        DVec2::new(self.left, self.bottom)
    }

    pub fn max(&self) -> DVec2 {
        DVec2::new(self.right, self.top)
    }

    pub fn size(&self) -> DVec2 {
        self.max() - self.min()
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    /// Inclusive containment, points on the border are inside.
    pub fn contains(&self, point: DVec2) -> bool {
        point.x >= self.left && point.x <= self.right && point.y >= self.bottom && point.y <= self.top
    }

    /// Whether the two areas share a region of positive size.
    /// Areas that only touch along an edge do not overlap.
    pub fn overlaps(&self, other: &WorldArea) -> bool {
        self.left < other.right
            && self.right > other.left
            && self.bottom < other.top
            && self.top > other.bottom
    }

    /// The area of the tile at `column`, `row` of a grid of `count` tiles.
    /// Row zero is the top (northern) row.
    pub fn tile_area(&self, count: UVec2, column: u32, row: u32) -> WorldArea {
        let tile_size = self.size() / count.as_dvec2();

        WorldArea {
            left: self.left + column as f64 * tile_size.x,
            right: self.left + (column + 1) as f64 * tile_size.x,
            top: self.top - row as f64 * tile_size.y,
            bottom: self.top - (row + 1) as f64 * tile_size.y,
        }
    }

    /// The grid cell containing `point`, if the point lies inside this area.
    pub fn tile_at(&self, count: UVec2, point: DVec2) -> Option<UVec2> {
        if !self.contains(point) {
            return None;
        }

        let tile_size = self.size() / count.as_dvec2();
        let column = ((point.x - self.left) / tile_size.x) as u32;
        let row = ((self.top - point.y) / tile_size.y) as u32;

        Some(UVec2::new(column.min(count.x - 1), row.min(count.y - 1)))
    }
}

/// The global coordinate and identifier of a tile blob.
///
/// `lod` counts from the coarsest level (0) towards the finest level of the tileset.
#[derive(
    Serialize, Deserialize, Copy, Clone, Default, Debug, Display, Hash, Eq, PartialEq, Ord, PartialOrd,
)]
#[display("{lod}_{x}_{y}")]
pub struct TileCoordinate {
    /// The column of the tile.
    pub x: u32,
    /// The row of the tile, where 0 is the top row.
    pub y: u32,
    /// The level of detail, where 0 is the coarsest level.
    pub lod: u32,
}

impl TileCoordinate {
    pub const INVALID: TileCoordinate = TileCoordinate {
        x: u32::MAX,
        y: u32::MAX,
        lod: u32::MAX,
    };

    pub fn new(x: u32, y: u32, lod: u32) -> Self {
        Self { x, y, lod }
    }

    pub fn xy(&self) -> UVec2 {
        UVec2::new(self.x, self.y)
    }

    pub fn with_lod(self, lod: u32) -> Self {
        Self { lod, ..self }
    }

    pub fn path(self, directory: &Path, extension: &str) -> PathBuf {
        directory.join(format!("{self}.{extension}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn empty_area_is_rejected() {
        assert!(WorldArea::new(0.0, 0.0, 0.0, 10.0).is_err());
        assert!(WorldArea::new(0.0, 5.0, 10.0, 1.0).is_err());
        assert!(WorldArea::new(0.0, 0.0, 10.0, 10.0).is_ok());
    }

    #[test]
    fn tiles_are_numbered_from_the_top_left() {
        let area = WorldArea::new(0.0, 0.0, 1000.0, 1000.0).unwrap();
        let tile = area.tile_area(UVec2::new(2, 2), 0, 0);

        assert_eq!(tile, WorldArea::new(0.0, 500.0, 500.0, 1000.0).unwrap());
        assert_eq!(
            area.tile_at(UVec2::new(2, 2), DVec2::new(750.0, 250.0)),
            Some(UVec2::new(1, 1))
        );
        assert_eq!(
            area.tile_at(UVec2::new(2, 2), DVec2::new(1000.0, 0.0)),
            Some(UVec2::new(1, 1))
        );
        assert_eq!(area.tile_at(UVec2::new(2, 2), DVec2::new(-1.0, 0.0)), None);
    }

    #[test]
    fn touching_areas_do_not_overlap() {
        let a = WorldArea::new(0.0, 0.0, 500.0, 500.0).unwrap();
        let b = WorldArea::new(500.0, 0.0, 1000.0, 500.0).unwrap();
        let c = WorldArea::new(499.0, 100.0, 600.0, 200.0).unwrap();

        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn tile_paths_are_unique() {
        let directory = Path::new("tiles");
        let mut paths = HashSet::new();

        for (x, y, lod) in itertools::iproduct!(0..12, 0..12, 0..12) {
            assert!(paths.insert(TileCoordinate::new(x, y, lod).path(directory, "tdf")));
        }
    }
}
