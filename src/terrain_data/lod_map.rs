use crate::math::TileCoordinate;
use anyhow::{bail, ensure, Result};
use glam::UVec2;
use serde::{Deserialize, Serialize};

/// The largest exponent a packed entry can hold.
pub const MAX_LOD_EXPONENT: u32 = 15;

/// The levels generated for one tile, as exponents of their edge sizes.
///
/// `highest` belongs to the finest level and `lowest` to the coarsest one.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct LodRange {
    pub highest: u32,
    pub lowest: u32,
}

impl LodRange {
    pub fn new(highest: u32, lowest: u32) -> Self {
        Self { highest, lowest }
    }

    pub fn lod_count(&self) -> u32 {
        self.highest - self.lowest + 1
    }

    fn pack(self) -> u8 {
        ((self.highest << 4) | self.lowest) as u8
    }

    fn unpack(byte: u8) -> Option<Self> {
        (byte != 0).then(|| LodRange::new((byte >> 4) as u32, (byte & 0xF) as u32))
    }
}

/// A compact record of the levels of detail that exist for each tile of a tileset.
///
/// Each tile occupies one byte, holding the exponents of its finest and coarsest level.
/// Tiles that were omitted from the tileset store zero.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LodExistenceMap {
    columns: u32,
    rows: u32,
    /// The exponent of the finest tile size of the whole tileset.
    max_exponent: u32,
    entries: Vec<u8>,
}

impl LodExistenceMap {
    pub fn new(columns: u32, rows: u32, max_exponent: u32) -> Self {
        Self {
            columns,
            rows,
            max_exponent,
            entries: vec![0; (columns * rows) as usize],
        }
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn max_exponent(&self) -> u32 {
        self.max_exponent
    }

    fn index(&self, tile: UVec2) -> Option<usize> {
        (tile.x < self.columns && tile.y < self.rows)
            .then(|| (tile.y * self.columns + tile.x) as usize)
    }

    /// Records the levels written for `tile`.
    pub fn insert(&mut self, tile: UVec2, range: LodRange) -> Result<()> {
        ensure!(
            range.lowest <= range.highest && range.highest <= self.max_exponent,
            "invalid lod range {range:?} for a maximum exponent of {}",
            self.max_exponent
        );
        ensure!(range.highest > 0, "a tile needs at least two samples per edge");

        let Some(index) = self.index(tile) else {
            bail!("tile {tile} lies outside of the {}x{} grid", self.columns, self.rows);
        };

        self.entries[index] = range.pack();

        Ok(())
    }

    pub fn get(&self, tile: UVec2) -> Option<LodRange> {
        self.index(tile)
            .and_then(|index| LodRange::unpack(self.entries[index]))
    }

    pub fn contains(&self, tile: UVec2) -> bool {
        self.get(tile).is_some()
    }

    pub fn lod_count(&self, tile: UVec2) -> u32 {
        self.get(tile).map_or(0, |range| range.lod_count())
    }

    /// The number of tiles present in the tileset.
    pub fn tile_count(&self) -> usize {
        self.entries.iter().filter(|&&entry| entry != 0).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UVec2, LodRange)> + '_ {
        self.entries.iter().enumerate().filter_map(|(index, &entry)| {
            let index = index as u32;
            LodRange::unpack(entry)
                .map(|range| (UVec2::new(index % self.columns, index / self.columns), range))
        })
    }

    /// Clamps the requested level to the levels that exist for the tile.
    /// Returns `None` for absent tiles.
    pub fn clamp_lod(&self, tile: UVec2, lod: u32) -> Option<TileCoordinate> {
        let range = self.get(tile)?;

        Some(TileCoordinate::new(tile.x, tile.y, lod.min(range.lod_count() - 1)))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.entries.len() == (self.columns * self.rows) as usize,
            "lod map holds {} entries for a {}x{} grid",
            self.entries.len(),
            self.columns,
            self.rows
        );
        ensure!(self.max_exponent <= MAX_LOD_EXPONENT, "maximum lod exponent too large");

        for (tile, range) in self.iter() {
            ensure!(
                range.lowest <= range.highest && range.highest <= self.max_exponent,
                "tile {tile} has the invalid lod range {range:?}"
            );
        }

        Ok(())
    }
}
