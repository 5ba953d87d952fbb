use crate::{
    math::{TileCoordinate, WorldArea},
    terrain_data::{lod_map::LodExistenceMap, TileFormat, INVALID_HEIGHT},
};
use anyhow::{ensure, Context, Result};
use glam::UVec2;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The file name of the descriptor inside a tileset directory.
pub const DESCRIPTOR_FILE_NAME: &str = "tileset.ron";
/// The file extension of tile blobs.
pub const TILE_EXTENSION: &str = "tdf";

/// The dataset level header of a generated tile pyramid.
///
/// It is written once, after every tile blob of the tileset was stored, and is read-only
/// afterwards. A directory without a descriptor never holds a usable tileset.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TilesetDescriptor {
    pub area: WorldArea,
    /// The identifier of the coordinate reference system of `area`.
    pub crs: String,
    pub columns: u32,
    pub rows: u32,
    /// The edge length in cells of the finest level of detail.
    pub lod0_size: u32,
    /// The maximum number of levels per tile.
    pub lod_count: u32,
    pub format: TileFormat,
    pub vertical_scale: f32,
    /// [`INVALID_HEIGHT`] for imagery tilesets.
    pub min_height: f32,
    /// [`INVALID_HEIGHT`] for imagery tilesets.
    pub max_height: f32,
    pub lod_map: LodExistenceMap,
}

impl TilesetDescriptor {
    pub fn tile_count(&self) -> UVec2 {
        UVec2::new(self.columns, self.rows)
    }

    pub fn tile_area(&self, tile: UVec2) -> WorldArea {
        self.area.tile_area(self.tile_count(), tile.x, tile.y)
    }

    /// The exponent of the coarsest level every tile starts at.
    pub fn coarsest_exponent(&self) -> u32 {
        self.lod0_size.trailing_zeros() + 1 - self.lod_count
    }

    /// The edge length in cells of a tile at level `lod`, counted from the coarsest level.
    pub fn tile_size(&self, lod: u32) -> u32 {
        1 << (self.coarsest_exponent() + lod)
    }

    /// The finest level whose sample spacing is at most `resolution` world units,
    /// or the finest level of the tileset if none is that fine.
    pub fn lod_for_resolution(&self, resolution: f64) -> u32 {
        let tile_width = self.area.width() / self.columns as f64;

        (0..self.lod_count)
            .find(|&lod| tile_width / self.tile_size(lod) as f64 <= resolution)
            .unwrap_or(self.lod_count - 1)
    }

    pub fn has_heights(&self) -> bool {
        self.format.is_elevation() && self.min_height != INVALID_HEIGHT
    }

    pub fn tile_path(root: &Path, coordinate: TileCoordinate) -> PathBuf {
        coordinate.path(root, TILE_EXTENSION)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.columns >= 1 && self.rows >= 1, "tile grid is empty");
        ensure!(
            self.lod0_size.is_power_of_two(),
            "tile size {} is not a power of two",
            self.lod0_size
        );
        ensure!(
            self.lod_count >= 1 && self.lod_count <= self.lod0_size.trailing_zeros(),
            "lod count {} does not fit tile size {}",
            self.lod_count,
            self.lod0_size
        );
        ensure!(
            self.lod_map.columns() == self.columns && self.lod_map.rows() == self.rows,
            "lod map does not match the tile grid"
        );
        ensure!(
            self.lod_map.max_exponent() == self.lod0_size.trailing_zeros(),
            "lod map does not match the tile size"
        );

        self.lod_map.validate()
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let encoded = fs::read_to_string(path)
            .with_context(|| format!("could not read the tileset descriptor {}", path.display()))?;
        let descriptor: Self = ron::from_str(&encoded)?;

        descriptor.validate()?;

        Ok(descriptor)
    }

    /// The descriptor in the RON format stored on disk.
    pub fn encode(&self) -> Result<String> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded = self.encode()?;
        fs::write(path.as_ref(), encoded).with_context(|| {
            format!("could not write the tileset descriptor {}", path.as_ref().display())
        })?;
        Ok(())
    }

    /// Loads the descriptor of the tileset stored in `directory`.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        Self::load_file(directory.as_ref().join(DESCRIPTOR_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain_data::lod_map::LodRange;

    fn descriptor() -> TilesetDescriptor {
        let mut lod_map = LodExistenceMap::new(2, 2, 8);
        lod_map.insert(UVec2::new(0, 0), LodRange::new(8, 6)).unwrap();
        lod_map.insert(UVec2::new(1, 1), LodRange::new(6, 6)).unwrap();

        TilesetDescriptor {
            area: WorldArea::new(0.0, 0.0, 1000.0, 1000.0).unwrap(),
            crs: "EPSG:32633".to_string(),
            columns: 2,
            rows: 2,
            lod0_size: 256,
            lod_count: 3,
            format: TileFormat::R32F,
            vertical_scale: 1.0,
            min_height: -12.0,
            max_height: 812.5,
            lod_map,
        }
    }

    #[test]
    fn descriptor_survives_saving() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join(DESCRIPTOR_FILE_NAME);

        descriptor().save_file(&path).unwrap();

        assert_eq!(TilesetDescriptor::open(directory.path()).unwrap(), descriptor());
    }

    #[test]
    fn levels_count_from_the_coarsest() {
        let descriptor = descriptor();

        assert_eq!(descriptor.coarsest_exponent(), 6);
        assert_eq!(descriptor.tile_size(0), 64);
        assert_eq!(descriptor.tile_size(2), 256);
        // a tile is 500 units wide
        assert_eq!(descriptor.lod_for_resolution(10.0), 0);
        assert_eq!(descriptor.lod_for_resolution(4.0), 1);
        assert_eq!(descriptor.lod_for_resolution(0.5), 2);
    }

    #[test]
    fn mismatching_lod_map_is_rejected() {
        let mut descriptor = descriptor();
        descriptor.lod_map = LodExistenceMap::new(3, 2, 8);

        assert!(descriptor.validate().is_err());
    }
}
