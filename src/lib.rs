//! This crate provides the runtime side of tiled multi-resolution terrain pyramids.
//!
//! # Background
//! Terrains covering large areas can not be kept in memory at full resolution.
//! Therefore the area is split into a grid of tiles, each of which is stored at several
//! levels of detail (LOD). Tiles without any source data are omitted entirely and tiles
//! whose source data is coarse only store the levels worth keeping.
//!
//! ## What exists?
//! Every tileset carries a [`TilesetDescriptor`](terrain::TilesetDescriptor) with its extent,
//! grid shape, height range and the [`LodExistenceMap`](terrain_data::lod_map::LodExistenceMap),
//! which records the levels present for every tile.
//!
//! ## How are tiles stored?
//! Each level of each tile is a separate blob in the Terrain Data Format (TDF), see the
//! [`formats`] module. Image tiles can be compressed by a pluggable
//! [`Compressor`](formats::Compressor).
//!
//! ## How are tiles accessed?
//! The [`TileCache`](terrain_data::tile_cache::TileCache) streams tiles from disk, either
//! synchronously or on background threads, and keeps them in a byte bounded cache.
//! It also answers height and ray queries against the best cached data.
//!
//! The tilesets themselves are generated by the `terrain_pyramid_preprocess` crate.

pub mod formats;
pub mod math;
pub mod terrain;
pub mod terrain_data;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        formats::{create_compressor, tdf::TDF, CompressionKind, Compressor},
        math::{TileCoordinate, WorldArea},
        terrain::TilesetDescriptor,
        terrain_data::{
            lod_map::{LodExistenceMap, LodRange},
            tile_cache::{
                LoadEvent, TerrainQuery, TileCache, TileCacheOptions, TileFetch, TileState,
            },
            SampleDepth, TileData, TileFormat, TileRaster, INVALID_HEIGHT,
        },
    };
}
