use crate::{
    formats::{decompressor_for, CompressionKind, Compressor},
    math::WorldArea,
    terrain_data::{TileData, TileFormat, TileRaster},
};
use anyhow::{anyhow, bail, ensure, Context, Result};
use std::{fs, path::Path};

const TDF_MAGIC: [u8; 4] = *b"TDF\0";
const TDF_VERSION: u8 = 1;

/// The header of a tile blob.
///
/// All values are stored in little endian, in the following order:
/// magic, version, format, compression, width, height, vertical scale,
/// left, bottom, right, top, CRS length and bytes, payload length.
#[derive(Clone, Debug, PartialEq)]
pub struct TDF {
    pub format: TileFormat,
    pub compression: CompressionKind,
    pub width: u32,
    pub height: u32,
    pub vertical_scale: f32,
    /// The spatial bounds of this tile.
    pub area: WorldArea,
    pub crs: String,
}

struct HeaderReader<'a> {
    encoded: &'a [u8],
    position: usize,
}

impl<'a> HeaderReader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self.position + count;
        ensure!(end <= self.encoded.len(), "tile blob is truncated");

        let bytes = &self.encoded[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn read<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut bytes = [0; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.read::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read()?))
    }
}

impl TDF {
    fn encode_header(&self, payload_size: usize) -> Result<Vec<u8>> {
        let crs_size = u16::try_from(self.crs.len()).context("CRS identifier is too long")?;
        let payload_size = u32::try_from(payload_size).context("tile payload is too large")?;

        let mut encoded = Vec::with_capacity(64 + self.crs.len() + payload_size as usize);
        encoded.extend_from_slice(&TDF_MAGIC);
        encoded.push(TDF_VERSION);
        encoded.push(self.format.id());
        encoded.push(self.compression.id());
        encoded.extend_from_slice(&self.width.to_le_bytes());
        encoded.extend_from_slice(&self.height.to_le_bytes());
        encoded.extend_from_slice(&self.vertical_scale.to_le_bytes());

        for bound in [self.area.left, self.area.bottom, self.area.right, self.area.top] {
            encoded.extend_from_slice(&bound.to_le_bytes());
        }

        encoded.extend_from_slice(&crs_size.to_le_bytes());
        encoded.extend_from_slice(self.crs.as_bytes());
        encoded.extend_from_slice(&payload_size.to_le_bytes());

        Ok(encoded)
    }

    /// Parses the header and returns it together with the payload.
    pub fn decode_header(encoded: &[u8]) -> Result<(Self, &[u8])> {
        let mut reader = HeaderReader {
            encoded,
            position: 0,
        };

        ensure!(reader.read::<4>()? == TDF_MAGIC, "not a tile blob");

        let version = reader.u8()?;
        ensure!(version == TDF_VERSION, "unsupported tile blob version {version}");

        let format = reader.u8()?;
        let format = TileFormat::from_id(format).ok_or_else(|| anyhow!("unknown tile format {format}"))?;
        let compression = reader.u8()?;
        let compression = CompressionKind::from_id(compression)
            .ok_or_else(|| anyhow!("unknown tile compression {compression}"))?;

        let width = reader.u32()?;
        let height = reader.u32()?;
        ensure!(width > 0 && height > 0, "tile blob has an empty {width}x{height} raster");
        ensure!(
            format.raster_bytes(width as usize, height as usize).is_some(),
            "tile blob raster of {width}x{height} is too large"
        );

        let vertical_scale = reader.f32()?;
        let area = WorldArea::new(reader.f64()?, reader.f64()?, reader.f64()?, reader.f64()?)?;

        let crs_size = reader.u16()? as usize;
        let crs = String::from_utf8(reader.take(crs_size)?.to_vec())?;

        let payload_size = reader.u32()? as usize;
        let payload = reader.take(payload_size)?;
        ensure!(
            reader.position == encoded.len(),
            "tile blob has trailing bytes"
        );

        let descriptor = TDF {
            format,
            compression,
            width,
            height,
            vertical_scale,
            area,
            crs,
        };

        Ok((descriptor, payload))
    }

    /// Encodes the raster into a tile blob.
    ///
    /// Falls back to storing the raw samples if the compressor does not support the format
    /// of the raster or does not make the payload any smaller.
    pub fn encode_alloc(
        raster: &TileRaster,
        crs: &str,
        compressor: Option<&dyn Compressor>,
    ) -> Result<Vec<u8>> {
        let (width, height) = raster.size();

        let mut descriptor = TDF {
            format: raster.format(),
            compression: CompressionKind::None,
            width: width as u32,
            height: height as u32,
            vertical_scale: raster.vertical_scale,
            area: raster.area,
            crs: crs.to_string(),
        };

        let mut payload = raster.data.to_bytes();

        if let Some(compressor) = compressor.filter(|compressor| compressor.supports(descriptor.format)) {
            let compressed =
                compressor.compress(&payload, descriptor.format, descriptor.width, descriptor.height)?;

            if compressed.len() < payload.len() {
                descriptor.compression = compressor.kind();
                payload = compressed;
            }
        }

        let mut encoded = descriptor.encode_header(payload.len())?;
        encoded.extend_from_slice(&payload);

        Ok(encoded)
    }

    pub fn decode_alloc(encoded: &[u8]) -> Result<(Self, TileRaster)> {
        let (descriptor, payload) = Self::decode_header(encoded)?;

        let decompressed;
        let samples = match decompressor_for(descriptor.compression) {
            None => payload,
            Some(compressor) => {
                if descriptor.format.is_elevation() {
                    bail!("{:?} compressed height tiles are not supported", descriptor.compression);
                }

                decompressed = compressor.decompress(
                    payload,
                    descriptor.format,
                    descriptor.width,
                    descriptor.height,
                )?;
                &decompressed
            }
        };

        let data = TileData::from_bytes(
            descriptor.format,
            descriptor.width as usize,
            descriptor.height as usize,
            samples,
        )?;
        let raster = TileRaster::new(descriptor.area, descriptor.vertical_scale, data);

        Ok((descriptor, raster))
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<(Self, TileRaster)> {
        let path = path.as_ref();
        let encoded =
            fs::read(path).with_context(|| format!("could not read tile {}", path.display()))?;

        Self::decode_alloc(&encoded).with_context(|| format!("could not decode tile {}", path.display()))
    }

    pub fn save_file<P: AsRef<Path>>(
        path: P,
        raster: &TileRaster,
        crs: &str,
        compressor: Option<&dyn Compressor>,
    ) -> Result<()> {
        let encoded = Self::encode_alloc(raster, crs, compressor)?;

        fs::write(path.as_ref(), encoded)
            .with_context(|| format!("could not write tile {}", path.as_ref().display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{BlockCompressor, QoiCompressor};
    use ndarray::Array2;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const CRS: &str = "EPSG:32633";

    fn area() -> WorldArea {
        WorldArea::new(500.0, 250.0, 750.0, 500.0).unwrap()
    }

    fn rasters() -> Vec<TileRaster> {
        let mut rng = StdRng::seed_from_u64(7);

        let data = [
            TileData::R16Scaled(Array2::from_shape_fn((17, 17), |_| rng.random())),
            TileData::R32F(Array2::from_shape_fn((17, 17), |_| rng.random_range(-50.0..3000.0))),
            TileData::Rgb8(Array2::from_shape_fn((16, 16), |_| rng.random())),
            TileData::Rgba8(Array2::from_shape_fn((16, 16), |_| rng.random())),
        ];

        data.into_iter()
            .map(|data| TileRaster::new(area(), 0.25, data))
            .collect()
    }

    #[test]
    fn uncompressed_blobs_round_trip() {
        for raster in rasters() {
            let encoded = TDF::encode_alloc(&raster, CRS, None).unwrap();
            let (descriptor, decoded) = TDF::decode_alloc(&encoded).unwrap();

            assert_eq!(descriptor.compression, CompressionKind::None);
            assert_eq!(descriptor.crs, CRS);
            assert_eq!(descriptor.area, area());
            assert_eq!(decoded, raster);
        }
    }

    #[test]
    fn block_compression_keeps_size_and_format() {
        for raster in rasters() {
            let encoded = TDF::encode_alloc(&raster, CRS, Some(&BlockCompressor)).unwrap();
            let (descriptor, decoded) = TDF::decode_alloc(&encoded).unwrap();

            if raster.format().is_elevation() {
                assert_eq!(descriptor.compression, CompressionKind::None);
                assert_eq!(decoded, raster);
            } else {
                assert_eq!(descriptor.compression, CompressionKind::Block);
                assert_eq!(decoded.format(), raster.format());
                assert_eq!(decoded.size(), raster.size());
                assert_eq!(decoded.area, raster.area);
            }
        }
    }

    #[test]
    fn qoi_never_grows_the_payload() {
        let flat = TileRaster::new(area(), 1.0, TileData::Rgb8(Array2::from_elem((32, 32), [10, 20, 30])));

        let encoded = TDF::encode_alloc(&flat, CRS, Some(&QoiCompressor)).unwrap();
        let (descriptor, decoded) = TDF::decode_alloc(&encoded).unwrap();

        assert_eq!(descriptor.compression, CompressionKind::Qoi);
        assert!(encoded.len() < flat.byte_size());
        assert_eq!(decoded, flat);

        for raster in rasters() {
            let encoded = TDF::encode_alloc(&raster, CRS, Some(&QoiCompressor)).unwrap();
            assert_eq!(TDF::decode_alloc(&encoded).unwrap().1, raster);
        }
    }

    #[test]
    fn malformed_blobs_are_rejected() {
        let raster = rasters().remove(1);
        let encoded = TDF::encode_alloc(&raster, CRS, None).unwrap();

        assert!(TDF::decode_alloc(&encoded[..encoded.len() - 1]).is_err());
        assert!(TDF::decode_alloc(&encoded[..10]).is_err());
        assert!(TDF::decode_alloc(&[]).is_err());

        let mut bad_magic = encoded.clone();
        bad_magic[0] = b'X';
        assert!(TDF::decode_alloc(&bad_magic).is_err());

        let mut bad_format = encoded.clone();
        bad_format[5] = 42;
        assert!(TDF::decode_alloc(&bad_format).is_err());

        let mut huge = encoded.clone();
        huge[7..15].copy_from_slice(&[u8::MAX; 8]);
        assert!(TDF::decode_alloc(&huge).is_err());

        let mut trailing = encoded;
        trailing.push(0);
        assert!(TDF::decode_alloc(&trailing).is_err());
    }

    #[test]
    fn empty_rasters_are_rejected() {
        let empty = TileRaster::new(area(), 1.0, TileData::R32F(Array2::zeros((0, 0))));
        let encoded = TDF::encode_alloc(&empty, CRS, None).unwrap();

        assert!(TDF::decode_header(&encoded).is_err());
        assert!(TDF::decode_alloc(&encoded).is_err());
    }

    #[test]
    fn blobs_are_written_to_disk() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("2_0_1.tdf");
        let raster = rasters().remove(0);

        TDF::save_file(&path, &raster, CRS, None).unwrap();
        let (descriptor, loaded) = TDF::load_file(&path).unwrap();

        assert_eq!(descriptor.format, TileFormat::R16Scaled);
        assert_eq!((descriptor.width, descriptor.height), (17, 17));
        assert_eq!(loaded, raster);
        assert!(TDF::load_file(directory.path().join("missing.tdf")).is_err());
    }
}
