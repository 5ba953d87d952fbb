//! Builds tiled terrain pyramids from overlapping elevation or imagery layers.
//!
//! Every tile of a [`TileGrid`](plan::TileGrid) is sampled at the resolution its finest
//! overlapping layer supports, gap filled, decimated into coarser levels and written as
//! TDF blobs next to a tileset descriptor, which `terrain_pyramid` streams back at runtime.

pub mod cli;
pub mod dataset;
pub mod derived;
pub mod downsample;
pub mod fill_no_data;
pub mod plan;
pub mod progress;
pub mod result;
pub mod source;
pub mod split;

use crate::{
    dataset::{
        publish_tilesets, TilesetWriter, TilingConfig, DERIVED_DIRECTORY, HEIGHT_DIRECTORY,
        IMAGERY_DIRECTORY,
    },
    derived::DerivedImageBuilder,
    downsample::decimate,
    fill_no_data::fill_gaps,
    plan::{plan_tiles, TileGrid, TilePlan},
    progress::{CountingProgressCallback, ProgressCallback},
    result::{PreprocessError, PreprocessResult},
    source::{ElevationSource, ImagerySource},
    split::{sample_heights, sample_imagery},
};
use std::{
    fmt,
    time::{Duration, Instant},
};
use terrain_pyramid::prelude::*;
use tracing::{debug, info, info_span, warn};

pub mod prelude {
    pub use crate::{
        build_pyramid,
        cli::{init_logging, Cli, PreprocessBar},
        dataset::{GapFillMethod, SamplingPolicy, Shading, SourceFile, TilingConfig},
        derived::{ColorRamp, LightConfig},
        progress::ProgressCallback,
        result::{PreprocessError, PreprocessResult},
        source::{
            ElevationGrid, ElevationSource, ImageryLayer, ImagerySource, SourceLayerSet,
            SourceRaster, Tin,
        },
        BuildReport,
    };
}

pub use source::SourceLayerSet;

/// The outcome of a successful build.
#[derive(Clone, Debug)]
pub struct BuildReport {
    /// The descriptor of the elevation or imagery tileset.
    pub tileset: TilesetDescriptor,
    /// The descriptor of the derived image tileset, if one was built.
    pub derived: Option<TilesetDescriptor>,
    pub tile_count: usize,
    /// Tiles without source data, or flat tiles when those are omitted.
    pub omitted_tiles: usize,
    pub filled_samples: usize,
    pub blob_count: usize,
    pub elapsed: Duration,
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "built {} tiles ({} omitted, {} blobs) in {:?}",
            self.tile_count, self.omitted_tiles, self.blob_count, self.elapsed
        )?;
        writeln!(f, "filled samples: {}", self.filled_samples)?;

        if self.tileset.has_heights() {
            writeln!(
                f,
                "heights: {} to {}",
                self.tileset.min_height, self.tileset.max_height
            )?;
        }

        Ok(())
    }
}

#[derive(Default)]
struct BuildStatistics {
    tile_count: usize,
    filled_samples: usize,
    height_range: Option<(f32, f32)>,
}

impl BuildStatistics {
    fn extend_height_range(&mut self, range: Option<(f32, f32)>) {
        self.height_range = match (self.height_range, range) {
            (Some((min, max)), Some((low, high))) => Some((min.min(low), max.max(high))),
            (current, None) => current,
            (None, range) => range,
        };
    }
}

/// Builds the tile pyramid of `sources` over `area` into `config.output`.
///
/// Tiles are written as they are finished, while the tileset descriptors are only written
/// once every tile of every tileset succeeded. A failed or cancelled build therefore never leaves a usable
/// tileset behind, but may leave tile blobs, which [`dataset::clear_directory`] removes.
pub fn build_pyramid(
    sources: &SourceLayerSet,
    area: WorldArea,
    config: &TilingConfig,
    progress_callback: Option<&ProgressCallback>,
) -> PreprocessResult<BuildReport> {
    let start = Instant::now();
    let _span = info_span!("build_pyramid", output = %config.output.display()).entered();

    config.validate()?;

    if sources.is_empty() {
        return Err(PreprocessError::SourceData("no source layers".into()));
    }

    let grid = config.grid(area);
    let plans = plan_tiles(&grid, &sources.footprints());

    if plans.is_empty() {
        return Err(PreprocessError::SourceData(
            "no source layer overlaps the tiled area".into(),
        ));
    }

    info!(
        "building {} of {} tiles from {} layers",
        plans.len(),
        grid.columns * grid.rows,
        sources.len()
    );

    // constructed once per batch, released when the build ends
    let compressor = create_compressor(config.compression);
    let progress = CountingProgressCallback::new(plans.len() as u64, progress_callback);

    let (statistics, tileset, derived, blob_count) = match sources {
        SourceLayerSet::Elevation(layers) => {
            let height_range = sources.height_range();
            build_elevation(layers, height_range, grid, &plans, config, compressor.as_deref(), &progress)?
        }
        SourceLayerSet::Imagery(layers) => {
            build_imagery(layers, grid, &plans, config, compressor.as_deref(), &progress)?
        }
    };

    let report = BuildReport {
        tileset,
        derived,
        tile_count: statistics.tile_count,
        omitted_tiles: (grid.columns * grid.rows) as usize - statistics.tile_count,
        filled_samples: statistics.filled_samples,
        blob_count,
        elapsed: start.elapsed(),
    };

    if report.tile_count == 0 {
        warn!("no tile had any valid sample, the tileset is empty");
    }

    info!(
        "built {} tiles and omitted {} in {:?}",
        report.tile_count, report.omitted_tiles, report.elapsed
    );

    Ok(report)
}

type BuildOutput = (
    BuildStatistics,
    TilesetDescriptor,
    Option<TilesetDescriptor>,
    usize,
);

/// `height_range` is the range reported by the layers themselves, which the color ramp of
/// derived images spans.
fn build_elevation(
    layers: &[Box<dyn ElevationSource>],
    height_range: Option<(f32, f32)>,
    grid: TileGrid,
    plans: &[TilePlan],
    config: &TilingConfig,
    compressor: Option<&dyn Compressor>,
    progress: &CountingProgressCallback,
) -> PreprocessResult<BuildOutput> {
    let mut tileset = TilesetWriter::new(
        config.output.join(HEIGHT_DIRECTORY),
        config,
        grid,
        config.sample_depth.into(),
        compressor,
    )?;

    let mut derived = config
        .create_derived_images
        .then(|| {
            let builder = DerivedImageBuilder::new(
                &config.color_ramp,
                height_range,
                config.shading,
                config.light,
                config.no_data_color,
            );
            let writer = TilesetWriter::new(
                config.output.join(DERIVED_DIRECTORY),
                config,
                grid,
                TileFormat::Rgba8,
                compressor,
            )?;

            Ok::<_, PreprocessError>((builder, writer))
        })
        .transpose()?;

    let mut statistics = BuildStatistics::default();
    let (lowest, highest) = config.sample_depth.height_limits(config.vertical_scale);

    for plan in plans {
        progress.poll(0.0)?;

        let mut sampled = sample_heights(layers, plan, config.sampling);

        if sampled.is_empty() {
            debug!("omitting tile {} without valid samples", plan.tile);
            progress.increment()?;
            continue;
        }

        if config.omit_flat_tiles && sampled.is_flat() {
            debug!("omitting flat tile {}", plan.tile);
            progress.increment()?;
            continue;
        }

        statistics.extend_height_range(sampled.height_range());

        if !sampled.is_complete() {
            let finest = TileCoordinate::new(plan.tile.x, plan.tile.y, plan.lod_count - 1);
            statistics.filled_samples += fill_gaps(&mut sampled.heights, config.gap_fill, finest)?;
            statistics.extend_height_range(sampled.height_range());
        }

        if let Some((min, max)) = sampled.height_range() {
            if min < lowest || max > highest {
                return Err(PreprocessError::Config(format!(
                    "heights of tile {} from {min} to {max} exceed the range {lowest} to {highest} \
                     of {:?} samples at a vertical scale of {}",
                    plan.tile, config.sample_depth, config.vertical_scale
                )));
            }
        }

        progress.poll(0.5)?;

        let heights = TileData::from_heights(&sampled.heights, config.sample_depth, config.vertical_scale);
        tileset.write_tile(plan, decimate(&heights, plan.lod_count))?;

        if let Some((builder, writer)) = &mut derived {
            let image = builder.build(&sampled.heights, plan.area.size() / plan.size as f64);
            writer.write_tile(plan, decimate(&TileData::Rgba8(image), plan.lod_count))?;
        }

        statistics.tile_count += 1;
        progress.increment()?;
    }

    let blob_count = tileset.blob_count()
        + derived.as_ref().map_or(0, |(_, writer)| writer.blob_count());

    let tileset = tileset.finish(statistics.height_range)?;
    let derived = derived
        .map(|(_, writer)| writer.finish(None))
        .transpose()?;

    publish_tilesets(&derived.iter().chain([&tileset]).collect::<Vec<_>>())?;

    Ok((
        statistics,
        tileset.descriptor,
        derived.map(|derived| derived.descriptor),
        blob_count,
    ))
}

fn build_imagery(
    layers: &[Box<dyn ImagerySource>],
    grid: TileGrid,
    plans: &[TilePlan],
    config: &TilingConfig,
    compressor: Option<&dyn Compressor>,
    progress: &CountingProgressCallback,
) -> PreprocessResult<BuildOutput> {
    let mut tileset = TilesetWriter::new(
        config.output.join(IMAGERY_DIRECTORY),
        config,
        grid,
        TileFormat::Rgba8,
        compressor,
    )?;

    let mut statistics = BuildStatistics::default();

    for plan in plans {
        progress.poll(0.0)?;

        let Some(pixels) = sample_imagery(layers, plan, config.no_data_color) else {
            debug!("omitting tile {} without imagery", plan.tile);
            progress.increment()?;
            continue;
        };

        tileset.write_tile(plan, decimate(&TileData::Rgba8(pixels), plan.lod_count))?;

        statistics.tile_count += 1;
        progress.increment()?;
    }

    let blob_count = tileset.blob_count();
    let tileset = tileset.finish(None)?;
    publish_tilesets(&[&tileset])?;

    Ok((statistics, tileset.descriptor, None, blob_count))
}
