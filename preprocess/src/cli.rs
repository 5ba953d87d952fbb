use crate::{
    dataset::{
        parse_area, parse_compression, parse_sample_depth, GapFillMethod, SamplingPolicy, Shading,
        SourceFile, TilingConfig,
    },
    progress::ProgressCallback,
    result::PreprocessResult,
    source::{ElevationGrid, ElevationSource, ImageryLayer, ImagerySource, SourceLayerSet},
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use terrain_pyramid::{formats::CompressionKind, math::WorldArea, terrain_data::SampleDepth};
use tracing::info;
use tracing_subscriber::EnvFilter;

const BAR_SIZE: u64 = 10000;

/// Builds a tiled terrain pyramid from elevation or imagery files.
///
/// Options given on the command line override those of the configuration file.
#[derive(Parser, Debug)]
#[command(name = "tpp", author, version, about)]
pub struct Cli {
    /// The directory the tilesets are written to.
    #[arg(required = true)]
    pub output: PathBuf,
    /// A source file and the area it covers, as path@left,bottom,right,top.
    #[arg(short, long = "source", required = true)]
    pub sources: Vec<SourceFile>,
    /// Treat the sources as imagery instead of 16 bit elevation images.
    #[arg(long, default_value_t = false)]
    pub imagery: bool,
    /// A RON file with the tiling configuration.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// The tiled area as left,bottom,right,top, the extent of all sources by default.
    #[arg(long, value_parser = parse_area)]
    pub area: Option<WorldArea>,

    #[arg(long)]
    pub columns: Option<u32>,
    #[arg(long)]
    pub rows: Option<u32>,
    #[arg(long)]
    pub lod0_size: Option<u32>,
    #[arg(long)]
    pub lod_count: Option<u32>,
    /// none, qoi, block or gpu
    #[arg(long, value_parser = parse_compression)]
    pub compression: Option<CompressionKind>,
    /// fast, smooth or region-growing
    #[arg(long)]
    pub gap_fill: Option<GapFillMethod>,
    /// last-valid or average
    #[arg(long)]
    pub sampling: Option<SamplingPolicy>,
    #[arg(long, default_value_t = false)]
    pub omit_flat: bool,
    /// Also build colored images from the heights.
    #[arg(long, default_value_t = false)]
    pub derived: bool,
    /// none, quick or directional
    #[arg(long)]
    pub shading: Option<Shading>,
    /// i16 or f32
    #[arg(long, value_parser = parse_sample_depth)]
    pub depth: Option<SampleDepth>,
    #[arg(long)]
    pub vertical_scale: Option<f32>,
    #[arg(long)]
    pub crs: Option<String>,

    /// The height of one step of the elevation images.
    #[arg(long, default_value_t = 1.0)]
    pub height_scale: f32,
    /// The height of the elevation image value zero.
    #[arg(long, default_value_t = 0.0)]
    pub height_offset: f32,
    /// The elevation image value marking missing data.
    #[arg(long)]
    pub no_data: Option<u16>,

    /// Remove the output directory before building.
    #[arg(short, long, default_value_t = false)]
    pub overwrite: bool,
}

impl Cli {
    pub fn tiling_config(&self) -> PreprocessResult<TilingConfig> {
        let mut config = match &self.config {
            Some(path) => TilingConfig::load_file(path)?,
            None => TilingConfig::default(),
        };

        config.output = self.output.clone();

        macro_rules! override_option {
            ($($field:ident <- $argument:ident),*) => {
                $(if let Some(value) = self.$argument.clone() {
                    config.$field = value;
                })*
            };
        }

        override_option!(
            columns <- columns,
            rows <- rows,
            lod0_size <- lod0_size,
            lod_count <- lod_count,
            compression <- compression,
            gap_fill <- gap_fill,
            sampling <- sampling,
            shading <- shading,
            sample_depth <- depth,
            vertical_scale <- vertical_scale,
            crs <- crs
        );

        config.omit_flat_tiles |= self.omit_flat;
        config.create_derived_images |= self.derived;

        config.validate()?;

        Ok(config)
    }

    pub fn load_sources(&self) -> PreprocessResult<SourceLayerSet> {
        if self.imagery {
            let layers = self
                .sources
                .iter()
                .map(|source| {
                    info!("loading imagery {}", source.path.display());
                    let layer = ImageryLayer::load_file(&source.path, source.area)?;
                    Ok(Box::new(layer) as Box<dyn ImagerySource>)
                })
                .collect::<PreprocessResult<_>>()?;

            Ok(SourceLayerSet::Imagery(layers))
        } else {
            let layers = self
                .sources
                .iter()
                .map(|source| {
                    info!("loading elevation {}", source.path.display());
                    let grid = ElevationGrid::load_file(
                        &source.path,
                        source.area,
                        self.height_scale,
                        self.height_offset,
                        self.no_data,
                    )?;
                    Ok(Box::new(grid) as Box<dyn ElevationSource>)
                })
                .collect::<PreprocessResult<_>>()?;

            Ok(SourceLayerSet::Elevation(layers))
        }
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A progress bar driven by the progress callback of a build.
pub struct PreprocessBar<'a> {
    name: String,
    bar: ProgressBar,
    callback: Box<ProgressCallback<'a>>,
}

impl PreprocessBar<'_> {
    pub fn new(name: String) -> Self {
        let style = ProgressStyle::with_template(
            &(name.clone() + ": {wide_bar} {percent} % [{elapsed}/{duration}]"),
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());

        let bar = ProgressBar::new(BAR_SIZE).with_style(style);

        let callback = Box::new({
            let progress_bar = bar.clone();
            move |completion: f64| {
                progress_bar.set_position((completion * BAR_SIZE as f64) as u64);
                false
            }
        });

        Self {
            name,
            bar,
            callback,
        }
    }

    pub fn callback(&self) -> &ProgressCallback {
        self.callback.as_ref()
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
        info!("{} took {:?}", self.name, self.bar.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_override_the_defaults() {
        let cli = Cli::try_parse_from([
            "tpp",
            "out",
            "--source",
            "a.png@0,0,10,10",
            "-s",
            "b.png@5,5,20,20",
            "--lod0-size",
            "512",
            "--gap-fill",
            "smooth",
            "--compression",
            "qoi",
            "--depth",
            "i16",
            "--omit-flat",
        ])
        .unwrap();

        assert_eq!(cli.sources.len(), 2);

        let config = cli.tiling_config().unwrap();
        assert_eq!(config.output, PathBuf::from("out"));
        assert_eq!(config.lod0_size, 512);
        assert_eq!(config.lod_count, TilingConfig::default().lod_count);
        assert_eq!(config.gap_fill, GapFillMethod::Smooth);
        assert_eq!(config.compression, CompressionKind::Qoi);
        assert_eq!(config.sample_depth, SampleDepth::Int16Scaled);
        assert!(config.omit_flat_tiles);
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["tpp", "out"]).is_err());
        assert!(Cli::try_parse_from(["tpp", "out", "-s", "a.png"]).is_err());

        let cli = Cli::try_parse_from(["tpp", "out", "-s", "a.png@0,0,1,1", "--lod0-size", "100"]).unwrap();
        assert!(cli.tiling_config().is_err());
    }
}
