use crate::{
    math::TileCoordinate,
    terrain::TilesetDescriptor,
    terrain_data::{
        tile_loader::{load_tile, LoadRequest, LoadedTile, TileLoader},
        TileRaster,
    },
};
use anyhow::{anyhow, ensure, Result};
use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use slab::Slab;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, warn};

const RAY_BISECTION_STEPS: u32 = 24;

/// The configuration of a [`TileCache`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TileCacheOptions {
    /// The maximum number of bytes of decoded tiles held in memory.
    pub byte_budget: usize,
    /// The number of background threads decoding tiles.
    pub worker_count: usize,
}

impl Default for TileCacheOptions {
    fn default() -> Self {
        Self {
            byte_budget: 256 << 20,
            worker_count: 2,
        }
    }
}

/// The outcome of [`TileCache::fetch_tile`].
#[derive(Debug)]
pub enum TileFetch {
    Ready(Arc<TileRaster>),
    /// The tile is being loaded in the background and becomes available after an
    /// [`update`](TileCache::update).
    Pending,
    Failed(anyhow::Error),
}

impl TileFetch {
    pub fn ready(self) -> Option<Arc<TileRaster>> {
        match self {
            TileFetch::Ready(raster) => Some(raster),
            TileFetch::Pending | TileFetch::Failed(_) => None,
        }
    }
}

/// The answer of a terrain query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TerrainQuery<T> {
    Found(T),
    /// There is no terrain at the queried location.
    Missing,
    /// A tile the query needs is not cached and the query may not block, or could not be loaded.
    Unknown,
}

impl<T> TerrainQuery<T> {
    pub fn found(self) -> Option<T> {
        match self {
            TerrainQuery::Found(value) => Some(value),
            TerrainQuery::Missing | TerrainQuery::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, TerrainQuery::Unknown)
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> TerrainQuery<U> {
        match self {
            TerrainQuery::Found(value) => TerrainQuery::Found(f(value)),
            TerrainQuery::Missing => TerrainQuery::Missing,
            TerrainQuery::Unknown => TerrainQuery::Unknown,
        }
    }
}

impl<T> From<Option<T>> for TerrainQuery<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(TerrainQuery::Missing, TerrainQuery::Found)
    }
}

/// The residency of a single tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileState {
    Absent,
    Loading,
    Cached,
}

/// A background load that finished during [`TileCache::update`].
#[derive(Debug)]
pub enum LoadEvent {
    Loaded(TileCoordinate),
    /// The tile could not be loaded and is absent again.
    Failed(TileCoordinate, anyhow::Error),
}

struct CacheEntry {
    raster: Arc<TileRaster>,
    byte_size: usize,
    /// The frame of the last fetch.
    frame: u64,
    /// Breaks ties between entries of the same frame.
    sequence: u64,
}

struct LoadingTile {
    coordinate: TileCoordinate,
    request: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<TileCoordinate, CacheEntry>,
    loading_tiles: Slab<LoadingTile>,
    tickets: HashMap<TileCoordinate, usize>,
    resident_bytes: usize,
    frame: u64,
    sequence: u64,
    requests: u64,
}

impl CacheState {
    fn touch(&mut self, coordinate: TileCoordinate) -> Option<Arc<TileRaster>> {
        let frame = self.frame;
        let entry = self.entries.get_mut(&coordinate)?;
        entry.frame = frame;

        Some(entry.raster.clone())
    }

    fn cancel(&mut self, coordinate: TileCoordinate) -> bool {
        self.tickets
            .remove(&coordinate)
            .map(|ticket| self.loading_tiles.remove(ticket))
            .is_some()
    }

    /// Takes the ticket of a finished load, unless it was cancelled or superseded.
    fn finish(&mut self, ticket: usize, request: u64, coordinate: TileCoordinate) -> bool {
        let current = self
            .loading_tiles
            .get(ticket)
            .is_some_and(|tile| tile.request == request && tile.coordinate == coordinate);

        if current {
            self.cancel(coordinate);
        }

        current
    }

    fn remove(&mut self, coordinate: TileCoordinate) {
        if let Some(entry) = self.entries.remove(&coordinate) {
            self.resident_bytes -= entry.byte_size;
        }
    }

    /// Evicts the least recently used entries until `byte_size` more bytes fit the budget.
    fn make_room(&mut self, byte_size: usize, byte_budget: usize) {
        while self.resident_bytes + byte_size > byte_budget {
            let Some(coordinate) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.frame, entry.sequence))
                .map(|(&coordinate, _)| coordinate)
            else {
                break;
            };

            debug!("evicting tile {coordinate}");
            self.remove(coordinate);
        }
    }

    fn insert(
        &mut self,
        coordinate: TileCoordinate,
        raster: TileRaster,
        byte_budget: usize,
    ) -> Arc<TileRaster> {
        let byte_size = raster.byte_size();
        let raster = Arc::new(raster);

        self.remove(coordinate);

        if byte_size > byte_budget {
            warn!("tile {coordinate} of {byte_size} bytes exceeds the cache budget and is not cached");
            return raster;
        }

        self.make_room(byte_size, byte_budget);

        self.entries.insert(
            coordinate,
            CacheEntry {
                raster: raster.clone(),
                byte_size,
                frame: self.frame,
                sequence: self.sequence,
            },
        );
        self.sequence += 1;
        self.resident_bytes += byte_size;

        raster
    }
}

/// Streams the tiles of a tileset from disk into a byte bounded in-memory cache.
///
/// Tiles are either loaded synchronously or requested from background threads, whose results
/// are inserted during [`update`](Self::update). Whenever the budget is exceeded, the tiles
/// that were fetched the longest time ago are evicted first.
///
/// Fetched rasters are shared snapshots. Evicting a tile never invalidates a raster that
/// a caller still holds, but the cache stops accounting for it.
pub struct TileCache {
    root: PathBuf,
    descriptor: TilesetDescriptor,
    byte_budget: usize,
    state: Mutex<CacheState>,
    loader: TileLoader,
}

impl TileCache {
    /// Opens the tileset stored in `root`.
    pub fn open<P: AsRef<Path>>(root: P, options: &TileCacheOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let descriptor = TilesetDescriptor::open(&root)?;

        Self::new(root, descriptor, options)
    }

    pub fn new(root: PathBuf, descriptor: TilesetDescriptor, options: &TileCacheOptions) -> Result<Self> {
        ensure!(options.worker_count > 0, "the tile cache needs at least one loader thread");

        Ok(Self {
            root,
            descriptor,
            byte_budget: options.byte_budget,
            state: Mutex::default(),
            loader: TileLoader::new(options.worker_count)?,
        })
    }

    pub fn descriptor(&self) -> &TilesetDescriptor {
        &self.descriptor
    }

    pub fn byte_budget(&self) -> usize {
        self.byte_budget
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the tileset contains the tile at this level.
    pub fn contains(&self, coordinate: TileCoordinate) -> bool {
        self.descriptor
            .lod_map
            .get(coordinate.xy())
            .is_some_and(|range| coordinate.lod < range.lod_count())
    }

    pub fn tile_state(&self, coordinate: TileCoordinate) -> TileState {
        let state = self.state();

        if state.entries.contains_key(&coordinate) {
            TileState::Cached
        } else if state.tickets.contains_key(&coordinate) {
            TileState::Loading
        } else {
            TileState::Absent
        }
    }

    pub fn resident_bytes(&self) -> usize {
        self.state().resident_bytes
    }

    /// The number of cached tiles.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects rasters whose format or size differs from what the tileset stores at their level.
    fn verify(&self, coordinate: TileCoordinate, raster: Result<TileRaster>) -> Result<TileRaster> {
        let raster = raster?;
        let format = self.descriptor.format;
        let size = format.raster_size(self.descriptor.tile_size(coordinate.lod)) as usize;

        ensure!(
            raster.format() == format && raster.size() == (size, size),
            "tile {coordinate} is a {:?} {:?} raster, expected {format:?} {size}x{size}",
            raster.size(),
            raster.format()
        );

        Ok(raster)
    }

    pub fn frame(&self) -> u64 {
        self.state().frame
    }

    /// Advances the frame counter that tiles are stamped with on every fetch.
    pub fn next_frame(&self) -> u64 {
        let mut state = self.state();
        state.frame += 1;
        state.frame
    }

    /// Returns the tile if it is cached.
    ///
    /// Otherwise it is either loaded synchronously (`may_block`) or requested from the
    /// background loader.
    pub fn fetch_tile(&self, coordinate: TileCoordinate, may_block: bool) -> TileFetch {
        if !self.contains(coordinate) {
            return TileFetch::Failed(anyhow!("tile {coordinate} is not part of the tileset"));
        }

        if let Some(raster) = self.state().touch(coordinate) {
            return TileFetch::Ready(raster);
        }

        let path = TilesetDescriptor::tile_path(&self.root, coordinate);

        if may_block {
            let raster = self.verify(coordinate, load_tile(&path));

            let mut state = self.state();
            state.cancel(coordinate);

            match raster {
                Ok(raster) => TileFetch::Ready(state.insert(coordinate, raster, self.byte_budget)),
                Err(error) => {
                    warn!("failed to load tile {coordinate}: {error:#}");
                    TileFetch::Failed(error)
                }
            }
        } else {
            let mut state = self.state();

            if state.tickets.contains_key(&coordinate) {
                return TileFetch::Pending;
            }

            let request = state.requests;
            state.requests += 1;

            let ticket = state.loading_tiles.insert(LoadingTile {
                coordinate,
                request,
            });
            state.tickets.insert(coordinate, ticket);

            let result = self.loader.request(LoadRequest {
                ticket,
                request,
                coordinate,
                path,
            });

            match result {
                Ok(()) => TileFetch::Pending,
                Err(error) => {
                    state.cancel(coordinate);
                    TileFetch::Failed(error)
                }
            }
        }
    }

    /// Stops waiting for a background load. Its result is discarded once it arrives.
    pub fn cancel(&self, coordinate: TileCoordinate) -> bool {
        self.state().cancel(coordinate)
    }

    /// Inserts the tiles finished by the background loader since the last update.
    pub fn update(&self) -> Vec<LoadEvent> {
        let mut events = Vec::new();

        while let Some(LoadedTile {
            ticket,
            request,
            coordinate,
            raster,
        }) = self.loader.try_loaded()
        {
            let mut state = self.state();

            if !state.finish(ticket, request, coordinate) {
                continue;
            }

            match self.verify(coordinate, raster) {
                Ok(raster) => {
                    state.insert(coordinate, raster, self.byte_budget);
                    events.push(LoadEvent::Loaded(coordinate));
                }
                Err(error) => {
                    warn!("failed to load tile {coordinate}: {error:#}");
                    events.push(LoadEvent::Failed(coordinate, error));
                }
            }
        }

        events
    }

    /// Drops every cached tile and pending request.
    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.loading_tiles.clear();
        state.tickets.clear();
        state.resident_bytes = 0;
    }

    /// The tile covering `point` at the level matching the query resolution,
    /// clamped to the levels that exist for that tile.
    fn query_tile(&self, point: DVec2, resolution: f64) -> Option<TileCoordinate> {
        let descriptor = &self.descriptor;
        let tile = descriptor.area.tile_at(descriptor.tile_count(), point)?;

        descriptor
            .lod_map
            .clamp_lod(tile, descriptor.lod_for_resolution(resolution))
    }

    /// The terrain height at `point`, sampled at a level with a spacing of at most
    /// `resolution` world units where available.
    ///
    /// The answer is [`TerrainQuery::Unknown`] if the tile is not cached and `may_block` is
    /// false. The request started by the query makes it available after an
    /// [`update`](Self::update).
    pub fn find_height(&self, point: DVec2, resolution: f64, may_block: bool) -> TerrainQuery<f32> {
        self.query(point, resolution, may_block, |raster| raster.interpolate_height(point))
    }

    /// The color at `point` of an imagery tileset.
    pub fn find_color(&self, point: DVec2, resolution: f64, may_block: bool) -> TerrainQuery<[u8; 4]> {
        self.query(point, resolution, may_block, |raster| raster.color(point))
    }

    fn query<T>(
        &self,
        point: DVec2,
        resolution: f64,
        may_block: bool,
        sample: impl FnOnce(&TileRaster) -> Option<T>,
    ) -> TerrainQuery<T> {
        let Some(coordinate) = self.query_tile(point, resolution) else {
            return TerrainQuery::Missing;
        };

        match self.fetch_tile(coordinate, may_block) {
            TileFetch::Ready(raster) => sample(raster.as_ref()).into(),
            TileFetch::Pending | TileFetch::Failed(_) => TerrainQuery::Unknown,
        }
    }

    /// Intersects a ray with the terrain surface, the `z` axis pointing up.
    ///
    /// The ray is marched in steps of `resolution` world units and the crossing is refined
    /// by bisection. Stretches without terrain are skipped, while reaching a tile that is not
    /// available answers [`TerrainQuery::Unknown`].
    pub fn ray_cast(
        &self,
        origin: DVec3,
        direction: DVec3,
        resolution: f64,
        may_block: bool,
    ) -> TerrainQuery<DVec3> {
        let Some(direction) = direction.try_normalize() else {
            return TerrainQuery::Missing;
        };
        let Some((start, end)) = self.ray_extent(origin, direction) else {
            return TerrainQuery::Missing;
        };

        let step = resolution.max(f64::EPSILON * self.descriptor.area.width());
        let elevation = |distance: f64| {
            let position = origin + direction * distance;
            self.find_height(position.truncate(), resolution, may_block)
                .map(|height| position.z - height as f64)
        };

        let mut previous = None;
        let mut distance = start;

        loop {
            match elevation(distance) {
                TerrainQuery::Found(above) if above <= 0.0 => {
                    let Some(mut outside) = previous else {
                        return TerrainQuery::Found(origin + direction * distance);
                    };
                    let mut inside = distance;

                    for _ in 0..RAY_BISECTION_STEPS {
                        let middle = 0.5 * (outside + inside);

                        match elevation(middle) {
                            TerrainQuery::Found(above) if above <= 0.0 => inside = middle,
                            _ => outside = middle,
                        }
                    }

                    return TerrainQuery::Found(origin + direction * inside);
                }
                TerrainQuery::Found(_) => previous = Some(distance),
                TerrainQuery::Missing => previous = None,
                TerrainQuery::Unknown => return TerrainQuery::Unknown,
            }

            if distance >= end {
                return TerrainQuery::Missing;
            }

            distance = (distance + step).min(end);
        }
    }

    /// The distances along the ray between which it can hit the terrain.
    fn ray_extent(&self, origin: DVec3, direction: DVec3) -> Option<(f64, f64)> {
        let descriptor = &self.descriptor;
        let (min, max) = (descriptor.area.min(), descriptor.area.max());

        let mut start = 0.0f64;
        let mut end = f64::INFINITY;

        for axis in 0..2 {
            if direction[axis].abs() < 1e-12 {
                if origin[axis] < min[axis] || origin[axis] > max[axis] {
                    return None;
                }
            } else {
                let near = (min[axis] - origin[axis]) / direction[axis];
                let far = (max[axis] - origin[axis]) / direction[axis];
                start = start.max(near.min(far));
                end = end.min(near.max(far));
            }
        }

        if descriptor.has_heights() {
            let (low, high) = (descriptor.min_height as f64, descriptor.max_height as f64);

            if direction.z < 0.0 {
                end = end.min((low - origin.z) / direction.z);
            } else if origin.z > high {
                return None;
            }
        }

        (start <= end && end.is_finite()).then_some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        formats::tdf::TDF,
        math::WorldArea,
        terrain::DESCRIPTOR_FILE_NAME,
        terrain_data::{lod_map::LodExistenceMap, lod_map::LodRange, TileData, TileFormat},
    };
    use glam::UVec2;
    use ndarray::Array2;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const MIB: usize = 1 << 20;

    /// Three 1024² RGBA tiles of 4 MiB each in a single row.
    fn image_tileset() -> TempDir {
        let directory = tempfile::tempdir().unwrap();
        let area = WorldArea::new(0.0, 0.0, 3000.0, 1000.0).unwrap();

        let mut lod_map = LodExistenceMap::new(3, 1, 10);

        for x in 0..3 {
            lod_map.insert(UVec2::new(x, 0), LodRange::new(10, 10)).unwrap();

            let data = TileData::Rgba8(Array2::from_elem((1024, 1024), [x as u8; 4]));
            let raster = TileRaster::new(area.tile_area(UVec2::new(3, 1), x, 0), 1.0, data);
            let coordinate = TileCoordinate::new(x, 0, 0);

            TDF::save_file(TilesetDescriptor::tile_path(directory.path(), coordinate), &raster, "", None)
                .unwrap();
        }

        TilesetDescriptor {
            area,
            crs: String::new(),
            columns: 3,
            rows: 1,
            lod0_size: 1024,
            lod_count: 1,
            format: TileFormat::Rgba8,
            vertical_scale: 1.0,
            min_height: crate::terrain_data::INVALID_HEIGHT,
            max_height: crate::terrain_data::INVALID_HEIGHT,
            lod_map,
        }
        .save_file(directory.path().join(DESCRIPTOR_FILE_NAME))
        .unwrap();

        directory
    }

    /// Two 16 unit tiles, where the height equals the x coordinate.
    fn slope_tileset() -> TempDir {
        let directory = tempfile::tempdir().unwrap();
        let area = WorldArea::new(0.0, 0.0, 32.0, 16.0).unwrap();

        let mut lod_map = LodExistenceMap::new(2, 1, 4);

        for x in 0..2 {
            lod_map.insert(UVec2::new(x, 0), LodRange::new(4, 3)).unwrap();

            let tile_area = area.tile_area(UVec2::new(2, 1), x, 0);
            let heights = Array2::from_shape_fn((17, 17), |(_, column)| {
                (tile_area.left + column as f64) as f32
            });
            let finest = TileData::R32F(heights);

            for (lod, data) in [(0, finest.subsample(2)), (1, finest)] {
                let raster = TileRaster::new(tile_area, 1.0, data);
                let coordinate = TileCoordinate::new(x, 0, lod);

                TDF::save_file(TilesetDescriptor::tile_path(directory.path(), coordinate), &raster, "", None)
                    .unwrap();
            }
        }

        TilesetDescriptor {
            area,
            crs: String::new(),
            columns: 2,
            rows: 1,
            lod0_size: 16,
            lod_count: 2,
            format: TileFormat::R32F,
            vertical_scale: 1.0,
            min_height: 0.0,
            max_height: 32.0,
            lod_map,
        }
        .save_file(directory.path().join(DESCRIPTOR_FILE_NAME))
        .unwrap();

        directory
    }

    fn cache(directory: &TempDir, byte_budget: usize) -> TileCache {
        let options = TileCacheOptions {
            byte_budget,
            worker_count: 2,
        };

        TileCache::open(directory.path(), &options).unwrap()
    }

    fn tile(x: u32) -> TileCoordinate {
        TileCoordinate::new(x, 0, 0)
    }

    fn wait_for_update(cache: &TileCache) -> Vec<LoadEvent> {
        let timeout = Instant::now() + Duration::from_secs(10);

        loop {
            let events = cache.update();

            if !events.is_empty() || Instant::now() > timeout {
                return events;
            }

            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn oldest_tile_is_evicted_first() {
        let directory = image_tileset();
        let cache = cache(&directory, 10 * MIB);

        for x in 0..3 {
            assert!(cache.fetch_tile(tile(x), true).ready().is_some());
        }

        assert_eq!(cache.tile_state(tile(0)), TileState::Absent);
        assert_eq!(cache.tile_state(tile(1)), TileState::Cached);
        assert_eq!(cache.tile_state(tile(2)), TileState::Cached);
        assert_eq!(cache.resident_bytes(), 8 * MIB);
    }

    #[test]
    fn fetching_refreshes_the_frame_stamp() {
        let directory = image_tileset();
        let cache = cache(&directory, 10 * MIB);

        cache.fetch_tile(tile(0), true);
        cache.fetch_tile(tile(1), true);
        cache.next_frame();
        cache.fetch_tile(tile(0), true);
        cache.fetch_tile(tile(2), true);

        assert_eq!(cache.tile_state(tile(0)), TileState::Cached);
        assert_eq!(cache.tile_state(tile(1)), TileState::Absent);
        assert_eq!(cache.tile_state(tile(2)), TileState::Cached);
    }

    #[test]
    fn resident_bytes_stay_within_the_budget() {
        let directory = image_tileset();
        let cache = cache(&directory, 9 * MIB);

        for x in [0, 1, 2, 1, 0, 0, 2, 1] {
            let raster = cache.fetch_tile(tile(x), true).ready().unwrap();
            assert_eq!(raster.color(raster.area.min()), Some([x as u8; 4]));
            assert!(cache.resident_bytes() <= cache.byte_budget());
            cache.next_frame();
        }

        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn oversized_tiles_are_not_cached() {
        let directory = image_tileset();
        let cache = cache(&directory, MIB);

        assert!(cache.fetch_tile(tile(0), true).ready().is_some());
        assert!(cache.is_empty());
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn background_loads_become_visible_after_update() {
        let directory = image_tileset();
        let cache = cache(&directory, 10 * MIB);

        assert!(matches!(cache.fetch_tile(tile(1), false), TileFetch::Pending));
        assert!(matches!(cache.fetch_tile(tile(1), false), TileFetch::Pending));
        assert_eq!(cache.tile_state(tile(1)), TileState::Loading);

        let events = wait_for_update(&cache);
        assert!(matches!(events.as_slice(), [LoadEvent::Loaded(coordinate)] if *coordinate == tile(1)));

        assert_eq!(cache.tile_state(tile(1)), TileState::Cached);
        assert!(matches!(cache.fetch_tile(tile(1), false), TileFetch::Ready(_)));
    }

    #[test]
    fn cancelled_loads_are_discarded() {
        let directory = image_tileset();
        let cache = cache(&directory, 10 * MIB);

        assert!(matches!(cache.fetch_tile(tile(0), false), TileFetch::Pending));
        assert!(cache.cancel(tile(0)));
        assert_eq!(cache.tile_state(tile(0)), TileState::Absent);

        std::thread::sleep(Duration::from_millis(200));

        assert!(cache.update().is_empty());
        assert_eq!(cache.tile_state(tile(0)), TileState::Absent);
    }

    #[test]
    fn failed_loads_revert_to_absent() {
        let directory = image_tileset();
        let cache = cache(&directory, 10 * MIB);

        std::fs::remove_file(TilesetDescriptor::tile_path(directory.path(), tile(2))).unwrap();
        std::fs::write(TilesetDescriptor::tile_path(directory.path(), tile(1)), b"corrupt").unwrap();

        assert!(matches!(cache.fetch_tile(tile(2), true), TileFetch::Failed(_)));
        assert_eq!(cache.tile_state(tile(2)), TileState::Absent);

        assert!(matches!(cache.fetch_tile(tile(1), false), TileFetch::Pending));
        let events = wait_for_update(&cache);
        assert!(matches!(events.as_slice(), [LoadEvent::Failed(coordinate, _)] if *coordinate == tile(1)));
        assert_eq!(cache.tile_state(tile(1)), TileState::Absent);

        assert!(matches!(cache.fetch_tile(TileCoordinate::new(0, 0, 1), true), TileFetch::Failed(_)));
        assert!(matches!(cache.fetch_tile(TileCoordinate::new(5, 0, 0), true), TileFetch::Failed(_)));
    }

    #[test]
    fn heights_are_found_at_the_requested_resolution() {
        let directory = slope_tileset();
        let cache = cache(&directory, 10 * MIB);

        assert_eq!(cache.find_height(DVec2::new(3.0, 4.0), 1.0, false), TerrainQuery::Unknown);
        assert_eq!(cache.find_height(DVec2::new(3.0, 4.0), 1.0, true), TerrainQuery::Found(3.0));
        assert_eq!(cache.tile_state(TileCoordinate::new(0, 0, 1)), TileState::Cached);

        assert_eq!(cache.find_height(DVec2::new(21.5, 8.0), 2.0, true), TerrainQuery::Found(21.5));
        assert_eq!(cache.tile_state(TileCoordinate::new(1, 0, 0)), TileState::Cached);

        assert_eq!(cache.find_height(DVec2::new(40.0, 8.0), 1.0, true), TerrainQuery::Missing);
    }

    #[test]
    fn rays_hit_the_surface() {
        let directory = slope_tileset();
        let cache = cache(&directory, 10 * MIB);

        let hit = cache
            .ray_cast(DVec3::new(10.5, 4.0, 100.0), DVec3::NEG_Z, 1.0, true)
            .found()
            .unwrap();
        assert!((hit - DVec3::new(10.5, 4.0, 10.5)).length() < 1e-3);

        let hit = cache
            .ray_cast(DVec3::new(0.0, 4.0, 10.0), DVec3::new(1.0, 0.0, -1.0), 0.5, true)
            .found()
            .unwrap();
        assert!((hit - DVec3::new(5.0, 4.0, 5.0)).length() < 1e-3);

        assert_eq!(cache.ray_cast(DVec3::new(0.0, 4.0, 40.0), DVec3::X, 1.0, true), TerrainQuery::Missing);
        assert_eq!(cache.ray_cast(DVec3::new(50.0, 4.0, 40.0), DVec3::NEG_Z, 1.0, true), TerrainQuery::Missing);
    }

    #[test]
    fn rays_over_uncached_tiles_are_unknown() {
        let directory = slope_tileset();
        let cache = cache(&directory, 10 * MIB);

        let origin = DVec3::new(10.5, 4.0, 100.0);

        assert!(cache.ray_cast(origin, DVec3::NEG_Z, 1.0, false).is_unknown());

        wait_for_update(&cache);
        assert!(cache.ray_cast(origin, DVec3::NEG_Z, 1.0, false).found().is_some());
    }

    #[test]
    fn rasters_of_the_wrong_shape_fail_to_load() {
        let directory = slope_tileset();
        let cache = cache(&directory, 10 * MIB);
        let coordinate = TileCoordinate::new(0, 0, 1);
        let path = TilesetDescriptor::tile_path(directory.path(), coordinate);
        let area = WorldArea::new(0.0, 0.0, 16.0, 16.0).unwrap();

        let empty = TileRaster::new(area, 1.0, TileData::R32F(Array2::zeros((0, 0))));
        std::fs::write(&path, TDF::encode_alloc(&empty, "", None).unwrap()).unwrap();

        assert!(matches!(cache.fetch_tile(coordinate, true), TileFetch::Failed(_)));
        assert!(cache.find_height(DVec2::new(3.0, 4.0), 1.0, true).is_unknown());

        let coarse = TileRaster::new(area, 1.0, TileData::R32F(Array2::zeros((9, 9))));
        TDF::save_file(&path, &coarse, "", None).unwrap();

        assert!(matches!(cache.fetch_tile(coordinate, true), TileFetch::Failed(_)));
        assert_eq!(cache.tile_state(coordinate), TileState::Absent);

        let colors = TileRaster::new(area, 1.0, TileData::Rgba8(Array2::from_elem((17, 17), [0; 4])));
        TDF::save_file(&path, &colors, "", None).unwrap();

        assert!(matches!(cache.fetch_tile(coordinate, true), TileFetch::Failed(_)));
        assert!(matches!(cache.fetch_tile(TileCoordinate::new(1, 0, 1), true), TileFetch::Ready(_)));
    }
}
