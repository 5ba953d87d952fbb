use crate::{
    derived::{ColorRamp, LightConfig},
    plan::{TileGrid, TilePlan},
    result::{PreprocessError, PreprocessResult},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use terrain_pyramid::{
    formats::{tdf::TDF, CompressionKind, Compressor},
    math::{TileCoordinate, WorldArea},
    terrain::{TilesetDescriptor, DESCRIPTOR_FILE_NAME},
    terrain_data::{lod_map::LodExistenceMap, SampleDepth, TileData, TileFormat, TileRaster, INVALID_HEIGHT},
};
use tracing::{debug, warn};

/// The directory of elevation tilesets inside the output directory.
pub const HEIGHT_DIRECTORY: &str = "height";
/// The directory of imagery tilesets inside the output directory.
pub const IMAGERY_DIRECTORY: &str = "imagery";
/// The directory of derived image tilesets inside the output directory.
pub const DERIVED_DIRECTORY: &str = "derived";

const MAX_TILE_SIZE: u32 = 1 << 15;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GapFillMethod {
    /// Propagates the mean of valid neighbours into the gaps.
    #[default]
    Fast,
    /// Relaxes the filled samples until they blend smoothly with their surroundings.
    Smooth,
    /// Grows the valid region by extrapolating the local slope.
    RegionGrowing,
}

impl FromStr for GapFillMethod {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fast" => Ok(GapFillMethod::Fast),
            "smooth" => Ok(GapFillMethod::Smooth),
            "region-growing" => Ok(GapFillMethod::RegionGrowing),
            other => Err(PreprocessError::Parse(format!("gap fill method {other}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Shading {
    #[default]
    None,
    /// Slope based shading without a light direction.
    Quick,
    /// Lambertian shading with the light described by [`LightConfig`].
    Directional,
}

impl FromStr for Shading {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(Shading::None),
            "quick" => Ok(Shading::Quick),
            "directional" => Ok(Shading::Directional),
            other => Err(PreprocessError::Parse(format!("shading {other}"))),
        }
    }
}

/// How the values of overlapping layers are combined.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SamplingPolicy {
    /// The last layer in input order with a valid value wins.
    #[default]
    LastValid,
    /// The mean of all valid values.
    Average,
}

impl FromStr for SamplingPolicy {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "last-valid" => Ok(SamplingPolicy::LastValid),
            "average" => Ok(SamplingPolicy::Average),
            other => Err(PreprocessError::Parse(format!("sampling policy {other}"))),
        }
    }
}

pub fn parse_compression(s: &str) -> PreprocessResult<CompressionKind> {
    match s.trim() {
        "none" => Ok(CompressionKind::None),
        "qoi" => Ok(CompressionKind::Qoi),
        "block" => Ok(CompressionKind::Block),
        "gpu" => Ok(CompressionKind::Gpu),
        other => Err(PreprocessError::Parse(format!("compression {other}"))),
    }
}

pub fn parse_sample_depth(s: &str) -> PreprocessResult<SampleDepth> {
    match s.trim() {
        "i16" => Ok(SampleDepth::Int16Scaled),
        "f32" => Ok(SampleDepth::Float32),
        other => Err(PreprocessError::Parse(format!("sample depth {other}"))),
    }
}

/// The parameters of a pyramid build. They are never changed during a build.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TilingConfig {
    pub columns: u32,
    pub rows: u32,
    pub lod0_size: u32,
    pub lod_count: u32,
    pub compression: CompressionKind,
    pub gap_fill: GapFillMethod,
    /// Omits tiles whose heights are all exactly zero, e.g. sea level.
    pub omit_flat_tiles: bool,
    pub create_derived_images: bool,
    pub shading: Shading,
    pub light: LightConfig,
    pub color_ramp: ColorRamp,
    /// The color of derived pixels without height and of imagery pixels without data.
    pub no_data_color: [u8; 4],
    pub sample_depth: SampleDepth,
    /// The height of one step of scaled 16 bit samples.
    pub vertical_scale: f32,
    pub sampling: SamplingPolicy,
    pub crs: String,
    pub output: PathBuf,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            columns: 1,
            rows: 1,
            lod0_size: 256,
            lod_count: 3,
            compression: CompressionKind::None,
            gap_fill: GapFillMethod::Fast,
            omit_flat_tiles: false,
            create_derived_images: false,
            shading: Shading::None,
            light: LightConfig::default(),
            color_ramp: ColorRamp::default(),
            no_data_color: [0; 4],
            sample_depth: SampleDepth::Float32,
            vertical_scale: 0.1,
            sampling: SamplingPolicy::LastValid,
            crs: String::new(),
            output: PathBuf::from("terrain"),
        }
    }
}

impl TilingConfig {
    pub fn load_file<P: AsRef<Path>>(path: P) -> PreprocessResult<Self> {
        let encoded = fs::read_to_string(path)?;
        let config: Self =
            ron::from_str(&encoded).map_err(|error| PreprocessError::Config(error.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> PreprocessResult<()> {
        let error = |message: String| Err(PreprocessError::Config(message));

        if self.columns == 0 || self.rows == 0 {
            return error(format!("a {}x{} tile grid is empty", self.columns, self.rows));
        }
        if !self.lod0_size.is_power_of_two() || !(2..=MAX_TILE_SIZE).contains(&self.lod0_size) {
            return error(format!(
                "tile size {} is not a power of two between 2 and {MAX_TILE_SIZE}",
                self.lod0_size
            ));
        }
        if self.lod_count == 0 || self.lod_count > self.lod0_size.trailing_zeros() {
            return error(format!(
                "{} levels do not fit a tile size of {}",
                self.lod_count, self.lod0_size
            ));
        }
        if !(self.vertical_scale > 0.0 && self.vertical_scale.is_finite()) {
            return error(format!("vertical scale {} is not positive", self.vertical_scale));
        }
        if self.crs.len() > u16::MAX as usize {
            return error("CRS identifier is too long".to_string());
        }

        self.light.validate()?;
        self.color_ramp.validate()
    }

    pub fn grid(&self, area: WorldArea) -> TileGrid {
        TileGrid {
            area,
            columns: self.columns,
            rows: self.rows,
            lod0_size: self.lod0_size,
            lod_count: self.lod_count,
        }
    }
}

/// Parses an area written as `left,bottom,right,top`.
pub fn parse_area(s: &str) -> PreprocessResult<WorldArea> {
    let bounds = s
        .split(',')
        .map(|bound| bound.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| PreprocessError::Parse(format!("bounds {s}: {error}")))?;

    let [left, bottom, right, top] = bounds[..] else {
        return Err(PreprocessError::Parse(format!(
            "an area needs four bounds, found {}",
            bounds.len()
        )));
    };

    WorldArea::new(left, bottom, right, top).map_err(|error| PreprocessError::Parse(error.to_string()))
}

/// A source file together with the area it covers, written as `path@left,bottom,right,top`.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub area: WorldArea,
}

impl FromStr for SourceFile {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, bounds) = s
            .rsplit_once('@')
            .ok_or_else(|| PreprocessError::Parse(format!("source {s}, expected path@left,bottom,right,top")))?;

        let area = parse_area(bounds)
            .map_err(|error| PreprocessError::Parse(format!("source {path}: {error}")))?;

        Ok(Self {
            path: PathBuf::from(path),
            area,
        })
    }
}

/// Stores the tiles of one tileset and finally its descriptor.
pub struct TilesetWriter<'a> {
    directory: PathBuf,
    grid: TileGrid,
    format: TileFormat,
    vertical_scale: f32,
    crs: &'a str,
    compressor: Option<&'a dyn Compressor>,
    lod_map: LodExistenceMap,
    blob_count: usize,
}

impl<'a> TilesetWriter<'a> {
    pub fn new(
        directory: PathBuf,
        config: &'a TilingConfig,
        grid: TileGrid,
        format: TileFormat,
        compressor: Option<&'a dyn Compressor>,
    ) -> PreprocessResult<Self> {
        fs::create_dir_all(&directory)?;

        Ok(Self {
            directory,
            grid,
            format,
            vertical_scale: config.vertical_scale,
            crs: &config.crs,
            compressor,
            lod_map: LodExistenceMap::new(grid.columns, grid.rows, grid.lod0_size.trailing_zeros()),
            blob_count: 0,
        })
    }

    pub fn blob_count(&self) -> usize {
        self.blob_count
    }

    /// Encodes and stores every level of a tile, ordered from coarsest to finest.
    pub fn write_tile(&mut self, plan: &TilePlan, lods: Vec<TileData>) -> PreprocessResult<()> {
        for (lod, data) in lods.into_iter().enumerate() {
            let coordinate = TileCoordinate::new(plan.tile.x, plan.tile.y, lod as u32);
            let raster = TileRaster::new(plan.area, self.vertical_scale, data);
            let encoded = TDF::encode_alloc(&raster, self.crs, self.compressor)?;

            fs::write(TilesetDescriptor::tile_path(&self.directory, coordinate), encoded)?;
            self.blob_count += 1;
        }

        self.lod_map.insert(plan.tile, plan.lod_range())?;

        debug!(
            "stored {} levels of tile {} in {}",
            plan.lod_count,
            plan.tile,
            self.directory.display()
        );

        Ok(())
    }

    /// Validates the descriptor of the stored tiles. The tileset only becomes usable once
    /// [`publish_tilesets`] writes it.
    pub fn finish(self, height_range: Option<(f32, f32)>) -> PreprocessResult<FinishedTileset> {
        let (min_height, max_height) = height_range.unwrap_or((INVALID_HEIGHT, INVALID_HEIGHT));

        let descriptor = TilesetDescriptor {
            area: self.grid.area,
            crs: self.crs.to_string(),
            columns: self.grid.columns,
            rows: self.grid.rows,
            lod0_size: self.grid.lod0_size,
            lod_count: self.grid.lod_count,
            format: self.format,
            vertical_scale: self.vertical_scale,
            min_height,
            max_height,
            lod_map: self.lod_map,
        };

        descriptor.validate()?;

        Ok(FinishedTileset {
            path: self.directory.join(DESCRIPTOR_FILE_NAME),
            descriptor,
        })
    }
}

/// A tileset whose blobs are all stored, but whose descriptor is not written yet.
#[derive(Debug)]
pub struct FinishedTileset {
    path: PathBuf,
    pub descriptor: TilesetDescriptor,
}

fn write_descriptor(tileset: &FinishedTileset) -> PreprocessResult<()> {
    fs::write(&tileset.path, tileset.descriptor.encode()?)?;
    Ok(())
}

/// Writes the descriptors of tilesets built together, in order.
///
/// If one of them can not be written, the ones written before are removed again, so that
/// either all tilesets become usable or none.
pub fn publish_tilesets(tilesets: &[&FinishedTileset]) -> PreprocessResult<()> {
    for (index, tileset) in tilesets.iter().enumerate() {
        if let Err(error) = write_descriptor(tileset) {
            for written in &tilesets[..index] {
                if let Err(error) = fs::remove_file(&written.path) {
                    warn!("could not remove {}: {error}", written.path.display());
                }
            }

            return Err(error);
        }
    }

    Ok(())
}

pub fn delete_directory(directory: &Path) -> PreprocessResult<()> {
    match fs::remove_dir_all(directory) {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error.into()),
        _ => Ok(()),
    }
}

/// Removes everything inside `directory`.
///
/// A failed build may leave tile blobs behind, which callers can discard with this.
pub fn clear_directory(directory: &Path) -> PreprocessResult<()> {
    delete_directory(directory)?;
    fs::create_dir_all(directory)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        TilingConfig::default().validate().unwrap();
    }

    #[test]
    fn invalid_tilings_are_rejected() {
        let invalid = [
            TilingConfig {
                lod0_size: 300,
                ..Default::default()
            },
            TilingConfig {
                lod0_size: 8,
                lod_count: 4,
                ..Default::default()
            },
            TilingConfig {
                columns: 0,
                ..Default::default()
            },
            TilingConfig {
                vertical_scale: 0.0,
                ..Default::default()
            },
        ];

        for config in invalid {
            assert!(matches!(config.validate(), Err(PreprocessError::Config(_))));
        }
    }

    #[test]
    fn config_is_read_from_ron() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("tiling.ron");

        fs::write(
            &path,
            "(columns: 4, rows: 2, lod0_size: 512, lod_count: 4, gap_fill: RegionGrowing, omit_flat_tiles: true)",
        )
        .unwrap();

        let config = TilingConfig::load_file(&path).unwrap();
        assert_eq!((config.columns, config.rows, config.lod0_size, config.lod_count), (4, 2, 512, 4));
        assert_eq!(config.gap_fill, GapFillMethod::RegionGrowing);
        assert!(config.omit_flat_tiles);
        assert_eq!(config.shading, Shading::None);

        fs::write(&path, "(lod0_size: 100)").unwrap();
        assert!(matches!(TilingConfig::load_file(&path), Err(PreprocessError::Config(_))));
    }

    #[test]
    fn sources_are_parsed() {
        let source: SourceFile = "dem/alps.png@0,-10.5,100,20".parse().unwrap();

        assert_eq!(source.path, PathBuf::from("dem/alps.png"));
        assert_eq!(source.area, WorldArea::new(0.0, -10.5, 100.0, 20.0).unwrap());

        assert!("dem.png".parse::<SourceFile>().is_err());
        assert!("dem.png@0,0,1".parse::<SourceFile>().is_err());
        assert!("dem.png@0,0,0,1".parse::<SourceFile>().is_err());
    }

    #[test]
    fn options_are_parsed() {
        assert_eq!("region-growing".parse::<GapFillMethod>().unwrap(), GapFillMethod::RegionGrowing);
        assert_eq!("directional".parse::<Shading>().unwrap(), Shading::Directional);
        assert_eq!(parse_compression("gpu").unwrap(), CompressionKind::Gpu);
        assert_eq!(parse_sample_depth("i16").unwrap(), SampleDepth::Int16Scaled);
        assert!(parse_compression("zip").is_err());
    }
}
