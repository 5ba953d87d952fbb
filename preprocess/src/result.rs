use terrain_pyramid::math::TileCoordinate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("invalid tiling configuration: {0}")]
    Config(String),
    #[error("invalid source data: {0}")]
    SourceData(String),
    #[error("the gaps of tile {tile} could not be filled")]
    GapFillFailure { tile: TileCoordinate },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0:#}")]
    Codec(#[from] anyhow::Error),
    #[error("could not parse {0}")]
    Parse(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("preprocessing was cancelled")]
    Cancelled,
}

pub type PreprocessResult<T> = Result<T, PreprocessError>;
