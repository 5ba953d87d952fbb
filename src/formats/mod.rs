//! The custom Terrain Data Format (TDF) that stores a single level of a single tile.
//!
//! The payload is optionally compressed by a pluggable [`Compressor`].
//! Image tiles can be stored losslessly with QOI or lossy with BC1 block compression.

mod bc1;
pub mod tdf;

use crate::terrain_data::TileFormat;
use anyhow::{anyhow, ensure, Result};
use bytemuck::cast_slice;
use rapid_qoi::{Colors, Qoi};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The compression applied to the payload of tile blobs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompressionKind {
    #[default]
    None,
    /// Lossless QOI compression of image tiles.
    Qoi,
    /// Lossy BC1 block compression of image tiles.
    Block,
    /// Block compression performed by the graphics driver.
    /// Requires a rendering context, which this crate does not provide.
    Gpu,
}

impl CompressionKind {
    pub(crate) fn id(self) -> u8 {
        match self {
            CompressionKind::None => 0,
            CompressionKind::Qoi => 1,
            CompressionKind::Block => 2,
            CompressionKind::Gpu => 3,
        }
    }

    pub(crate) fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(CompressionKind::None),
            1 => Some(CompressionKind::Qoi),
            2 => Some(CompressionKind::Block),
            3 => Some(CompressionKind::Gpu),
            _ => None,
        }
    }
}

/// A capability that compresses the raw payload of tile blobs.
///
/// Implementations are created once per batch and shared by every tile.
pub trait Compressor: Send + Sync {
    /// The tag recorded in the header of blobs compressed by this compressor.
    fn kind(&self) -> CompressionKind;

    fn supports(&self, format: TileFormat) -> bool;

    /// Compresses little endian samples of a `width × height` tile.
    fn compress(&self, raw: &[u8], format: TileFormat, width: u32, height: u32) -> Result<Vec<u8>>;

    /// Restores the little endian samples of a `width × height` tile.
    fn decompress(&self, blob: &[u8], format: TileFormat, width: u32, height: u32) -> Result<Vec<u8>>;
}

fn qoi_colors(format: TileFormat) -> Result<Colors> {
    match format {
        TileFormat::Rgb8 => Ok(Colors::Rgb),
        TileFormat::Rgba8 => Ok(Colors::Rgba),
        _ => Err(anyhow!("QOI can not store {format:?} tiles")),
    }
}

pub struct QoiCompressor;

impl Compressor for QoiCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Qoi
    }

    fn supports(&self, format: TileFormat) -> bool {
        !format.is_elevation()
    }

    fn compress(&self, raw: &[u8], format: TileFormat, width: u32, height: u32) -> Result<Vec<u8>> {
        let descriptor = Qoi {
            width,
            height,
            colors: qoi_colors(format)?,
        };

        descriptor
            .encode_alloc(raw)
            .map_err(|error| anyhow!("QOI encoding failed: {error:?}"))
    }

    fn decompress(&self, blob: &[u8], format: TileFormat, width: u32, height: u32) -> Result<Vec<u8>> {
        let (descriptor, decoded) =
            Qoi::decode_alloc(blob).map_err(|error| anyhow!("QOI decoding failed: {error:?}"))?;

        ensure!(
            descriptor.width == width && descriptor.height == height,
            "QOI image is {}x{}, expected {width}x{height}",
            descriptor.width,
            descriptor.height
        );
        ensure!(
            format.raster_bytes(width as usize, height as usize) == Some(decoded.len()),
            "QOI image does not match the {format:?} format"
        );

        Ok(decoded)
    }
}

/// BC1 compression on the CPU.
///
/// Blobs written by GPU compressors hold the same block layout and are decoded by it as well.
pub struct BlockCompressor;

impl Compressor for BlockCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Block
    }

    fn supports(&self, format: TileFormat) -> bool {
        !format.is_elevation()
    }

    fn compress(&self, raw: &[u8], format: TileFormat, width: u32, height: u32) -> Result<Vec<u8>> {
        let (width, height) = (width as usize, height as usize);
        ensure!(width > 0 && height > 0, "can not compress an empty tile");

        let pixels: Vec<[u8; 4]> = match format {
            TileFormat::Rgb8 => cast_slice::<u8, [u8; 3]>(raw)
                .iter()
                .map(|&[r, g, b]| [r, g, b, u8::MAX])
                .collect(),
            TileFormat::Rgba8 => cast_slice(raw).to_vec(),
            _ => return Err(anyhow!("block compression can not store {format:?} tiles")),
        };

        ensure!(pixels.len() == width * height, "payload does not match the tile size");

        Ok(bc1::compress(&pixels, width, height))
    }

    fn decompress(&self, blob: &[u8], format: TileFormat, width: u32, height: u32) -> Result<Vec<u8>> {
        let (width, height) = (width as usize, height as usize);

        let expected = bc1::compressed_size(width, height)
            .ok_or_else(|| anyhow!("a {width}x{height} tile is too large"))?;
        ensure!(
            blob.len() == expected,
            "expected {expected} bytes of BC1 blocks, found {}",
            blob.len()
        );

        let pixels = bc1::decompress(blob, width, height);

        Ok(match format {
            TileFormat::Rgb8 => pixels.iter().flat_map(|&[r, g, b, _]| [r, g, b]).collect(),
            TileFormat::Rgba8 => cast_slice(&pixels).to_vec(),
            _ => return Err(anyhow!("block compression can not store {format:?} tiles")),
        })
    }
}

/// Creates the compressor for a batch. `None` means the payload is stored uncompressed.
pub fn create_compressor(kind: CompressionKind) -> Option<Box<dyn Compressor>> {
    match kind {
        CompressionKind::None => None,
        CompressionKind::Qoi => Some(Box::new(QoiCompressor)),
        CompressionKind::Block => Some(Box::new(BlockCompressor)),
        CompressionKind::Gpu => {
            warn!("GPU texture compression is not available, tiles are stored uncompressed");
            None
        }
    }
}

/// The compressor able to restore a payload tagged with `kind`.
pub(crate) fn decompressor_for(kind: CompressionKind) -> Option<Box<dyn Compressor>> {
    match kind {
        CompressionKind::None => None,
        CompressionKind::Qoi => Some(Box::new(QoiCompressor)),
        CompressionKind::Block | CompressionKind::Gpu => Some(Box::new(BlockCompressor)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_compression_falls_back_to_none() {
        assert!(create_compressor(CompressionKind::Gpu).is_none());
        assert!(create_compressor(CompressionKind::None).is_none());
        assert_eq!(
            create_compressor(CompressionKind::Block).map(|compressor| compressor.kind()),
            Some(CompressionKind::Block)
        );
    }

    #[test]
    fn image_compressors_reject_heights() {
        for kind in [CompressionKind::Qoi, CompressionKind::Block] {
            let compressor = create_compressor(kind).unwrap();

            assert!(!compressor.supports(TileFormat::R32F));
            assert!(!compressor.supports(TileFormat::R16Scaled));
            assert!(compressor.supports(TileFormat::Rgb8));
            assert!(compressor
                .compress(&[0; 16], TileFormat::R32F, 2, 2)
                .is_err());
        }
    }

    #[test]
    fn qoi_is_lossless() {
        let raw: Vec<u8> = (0..8 * 8 * 4).map(|i| (i * 7 % 256) as u8).collect();

        let blob = QoiCompressor.compress(&raw, TileFormat::Rgba8, 8, 8).unwrap();
        let decoded = QoiCompressor.decompress(&blob, TileFormat::Rgba8, 8, 8).unwrap();

        assert_eq!(decoded, raw);
        assert!(QoiCompressor.decompress(&blob, TileFormat::Rgba8, 4, 16).is_err());
    }
}
