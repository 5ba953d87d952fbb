//! Colorized and shaded images derived from elevation tiles.

use crate::{
    dataset::Shading,
    result::{PreprocessError, PreprocessResult},
};
use glam::{DVec2, Vec3};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use terrain_pyramid::terrain_data::INVALID_HEIGHT;
use tracing::warn;

const COLOR_TABLE_SIZE: usize = 4000;
/// The minimum brightness of quick shading, reached by vertical walls.
const QUICK_SHADING_BIAS: f32 = 0.3;

/// Heights mapped to colors, interpolated linearly between sorted control points.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ColorRamp {
    /// Control point heights lie in `[0, 1]` and are mapped onto the height range of the
    /// dataset.
    pub relative: bool,
    pub points: Vec<(f32, [u8; 3])>,
}

impl Default for ColorRamp {
    fn default() -> Self {
        Self {
            relative: true,
            points: vec![
                (0.0, [38, 115, 77]),
                (0.3, [122, 163, 84]),
                (0.55, [196, 180, 120]),
                (0.8, [140, 110, 90]),
                (1.0, [250, 250, 250]),
            ],
        }
    }
}

impl ColorRamp {
    pub fn validate(&self) -> PreprocessResult<()> {
        if self.points.is_empty() {
            return Err(PreprocessError::Config("a color ramp needs control points".into()));
        }

        if self.points.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(PreprocessError::Config(
                "color ramp heights must be strictly ascending".into(),
            ));
        }

        if self.relative
            && self
                .points
                .iter()
                .any(|&(height, _)| !(0.0..=1.0).contains(&height))
        {
            return Err(PreprocessError::Config(
                "relative color ramp heights must lie in [0, 1]".into(),
            ));
        }

        Ok(())
    }

    /// The range the ramp covers on its own.
    fn height_range(&self) -> (f32, f32) {
        let first = self.points.first().map_or(0.0, |point| point.0);
        let last = self.points.last().map_or(1.0, |point| point.0);
        (first, last)
    }

    fn color(&self, height: f32) -> [u8; 3] {
        let upper = self.points.partition_point(|&(point, _)| point <= height);

        match upper {
            0 => self.points.first().map_or([0; 3], |point| point.1),
            upper if upper == self.points.len() => self.points[upper - 1].1,
            upper => {
                let (low, low_color) = self.points[upper - 1];
                let (high, high_color) = self.points[upper];
                let t = (height - low) / (high - low);

                std::array::from_fn(|channel| {
                    let low = low_color[channel] as f32;
                    let high = high_color[channel] as f32;
                    (low + (high - low) * t).round() as u8
                })
            }
        }
    }
}

/// A dense lookup table of a color ramp over a height range.
#[derive(Clone, Debug)]
pub struct ColorTable {
    min_height: f32,
    max_height: f32,
    colors: Vec<[u8; 3]>,
}

impl ColorTable {
    pub fn new(ramp: &ColorRamp, (min_height, max_height): (f32, f32)) -> Self {
        let to_ramp = |height: f32| {
            if ramp.relative && max_height > min_height {
                (height - min_height) / (max_height - min_height)
            } else if ramp.relative {
                0.0
            } else {
                height
            }
        };

        let colors = (0..COLOR_TABLE_SIZE)
            .map(|index| {
                let height = min_height
                    + (max_height - min_height) * index as f32 / (COLOR_TABLE_SIZE - 1) as f32;
                ramp.color(to_ramp(height))
            })
            .collect();

        Self {
            min_height,
            max_height,
            colors,
        }
    }

    pub fn color(&self, height: f32) -> [u8; 3] {
        let extent = self.max_height - self.min_height;

        let index = if extent > 0.0 {
            ((height - self.min_height) / extent * (COLOR_TABLE_SIZE - 1) as f32).round()
        } else {
            0.0
        };

        self.colors[num::clamp(index, 0.0, (COLOR_TABLE_SIZE - 1) as f32) as usize]
    }
}

/// The light of directional shading.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct LightConfig {
    /// The elevation of the light above the horizon in degrees.
    pub cast_angle: f32,
    /// The azimuth of the light in degrees, clockwise from north.
    pub cast_direction: f32,
    /// The brightness of surfaces facing away from the light, in `[0, 1]`.
    pub ambient: f32,
    pub gamma: f32,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            cast_angle: 45.0,
            cast_direction: 315.0,
            ambient: 0.25,
            gamma: 1.0,
        }
    }
}

impl LightConfig {
    pub fn validate(&self) -> PreprocessResult<()> {
        if !(0.0..=90.0).contains(&self.cast_angle) {
            return Err(PreprocessError::Config(format!(
                "light angle {} is not between 0 and 90 degrees",
                self.cast_angle
            )));
        }
        if !(0.0..=1.0).contains(&self.ambient) {
            return Err(PreprocessError::Config(format!(
                "ambient light {} is not between 0 and 1",
                self.ambient
            )));
        }
        if !(self.gamma > 0.0) {
            return Err(PreprocessError::Config(format!("gamma {} is not positive", self.gamma)));
        }

        Ok(())
    }

    /// The unit vector pointing towards the light, with x east, y north and z up.
    pub fn direction(&self) -> Vec3 {
        let (elevation, azimuth) = (self.cast_angle.to_radians(), self.cast_direction.to_radians());

        Vec3::new(
            azimuth.sin() * elevation.cos(),
            azimuth.cos() * elevation.cos(),
            elevation.sin(),
        )
    }
}

/// Turns the heights of elevation tiles into colored images.
pub struct DerivedImageBuilder {
    table: ColorTable,
    shading: Shading,
    light: LightConfig,
    no_data_color: [u8; 4],
}

impl DerivedImageBuilder {
    /// `height_range` is the range the color ramp is spread over, the ramp's own range
    /// if unknown.
    pub fn new(
        ramp: &ColorRamp,
        height_range: Option<(f32, f32)>,
        shading: Shading,
        light: LightConfig,
        no_data_color: [u8; 4],
    ) -> Self {
        let height_range = height_range.unwrap_or_else(|| {
            let fallback = ramp.height_range();

            if ramp.relative {
                warn!(
                    "the height range of the sources is unknown, the relative color ramp spans {} to {} instead",
                    fallback.0, fallback.1
                );
            }

            fallback
        });

        Self {
            table: ColorTable::new(ramp, height_range),
            shading,
            light,
            no_data_color,
        }
    }

    fn brightness(&self, normal: Vec3) -> f32 {
        match self.shading {
            Shading::None => 1.0,
            Shading::Quick => QUICK_SHADING_BIAS + (1.0 - QUICK_SHADING_BIAS) * normal.z,
            Shading::Directional => {
                let diffuse = normal.dot(self.light.direction()).max(0.0);
                let brightness = self.light.ambient + (1.0 - self.light.ambient) * diffuse;
                brightness.powf(1.0 / self.light.gamma)
            }
        }
    }

    /// Builds the image of a `(size + 1)²` vertex grid, whose cells are `spacing` apart.
    ///
    /// Pixel `(i, j)` is colored by the mean of the four vertices around it, so the image
    /// has `size²` pixels.
    pub fn build(&self, heights: &Array2<f32>, spacing: DVec2) -> Array2<[u8; 4]> {
        let (rows, columns) = heights.dim();
        let (rows, columns) = (rows.saturating_sub(1), columns.saturating_sub(1));
        let spacing = spacing.as_vec2();

        let pixels = (0..rows)
            .into_par_iter()
            .map(|row| {
                (0..columns)
                    .map(|column| {
                        let h00 = heights[(row, column)];
                        let h10 = heights[(row, column + 1)];
                        let h01 = heights[(row + 1, column)];
                        let h11 = heights[(row + 1, column + 1)];

                        if [h00, h10, h01, h11].contains(&INVALID_HEIGHT) {
                            return self.no_data_color;
                        }

                        // rows run southwards
                        let east = ((h10 - h00) + (h11 - h01)) / (2.0 * spacing.x);
                        let north = ((h00 - h01) + (h10 - h11)) / (2.0 * spacing.y);
                        let normal = Vec3::new(-east, -north, 1.0).normalize();

                        let brightness = self.brightness(normal);
                        let [r, g, b] = self.table.color((h00 + h10 + h01 + h11) / 4.0);
                        let shade = |channel: u8| num::clamp(channel as f32 * brightness, 0.0, 255.0).round() as u8;

                        [shade(r), shade(g), shade(b), 255]
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        Array2::from_shape_fn((rows, columns), |(row, column)| pixels[row][column])
    }
}
