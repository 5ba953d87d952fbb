use crate::{
    dataset::SamplingPolicy,
    plan::TilePlan,
    source::{ElevationSource, ImagerySource},
};
use glam::DVec2;
use ndarray::Array2;
use rayon::prelude::*;
use terrain_pyramid::terrain_data::INVALID_HEIGHT;

/// The heights of a tile at its finest generated level, before gap filling.
#[derive(Clone, Debug)]
pub struct SampledHeights {
    /// A `(size + 1)²` vertex grid, indexed by `[row, column]`.
    pub heights: Array2<f32>,
    pub invalid_count: usize,
}

impl SampledHeights {
    pub fn is_empty(&self) -> bool {
        self.invalid_count == self.heights.len()
    }

    pub fn is_complete(&self) -> bool {
        self.invalid_count == 0
    }

    /// Whether every sample is exactly zero.
    pub fn is_flat(&self) -> bool {
        self.heights.iter().all(|&height| height == 0.0)
    }

    /// The range of the valid samples.
    pub fn height_range(&self) -> Option<(f32, f32)> {
        self.heights
            .iter()
            .copied()
            .filter(|&height| height != INVALID_HEIGHT)
            .fold(None, |range, height| match range {
                None => Some((height, height)),
                Some((min, max)) => Some((height.min(min), height.max(max))),
            })
    }
}

/// Samples rows in parallel. The result does not depend on the number of threads.
fn sample_grid<T: Send>(rows: usize, columns: usize, sample: impl Fn(usize, usize) -> T + Sync) -> Vec<Vec<T>> {
    (0..rows)
        .into_par_iter()
        .map(|row| (0..columns).map(|column| sample(row, column)).collect())
        .collect()
}

fn combine_heights(heights: impl Iterator<Item = f32>, policy: SamplingPolicy) -> Option<f32> {
    match policy {
        SamplingPolicy::LastValid => heights.last(),
        SamplingPolicy::Average => {
            let (sum, count) = heights.fold((0.0, 0), |(sum, count), height| (sum + height, count + 1));
            (count > 0).then(|| sum / count as f32)
        }
    }
}

/// Samples the elevation layers of a plan at the vertices of its finest level.
///
/// Vertex `(i, j)` lies at `(left + i·w/size, top − j·h/size)`, so neighbouring tiles share
/// their edge vertices.
pub fn sample_heights(
    layers: &[Box<dyn ElevationSource>],
    plan: &TilePlan,
    policy: SamplingPolicy,
) -> SampledHeights {
    let size = plan.size as usize;
    let spacing = plan.area.size() / plan.size as f64;
    let layers = plan.layers.iter().map(|&index| &layers[index]).collect::<Vec<_>>();

    let rows = sample_grid(size + 1, size + 1, |row, column| {
        let point = DVec2::new(
            plan.area.left + column as f64 * spacing.x,
            plan.area.top - row as f64 * spacing.y,
        );

        combine_heights(layers.iter().filter_map(|layer| layer.height_at(point)), policy)
            .unwrap_or(INVALID_HEIGHT)
    });

    let heights = Array2::from_shape_fn((size + 1, size + 1), |(row, column)| rows[row][column]);
    let invalid_count = heights.iter().filter(|&&height| height == INVALID_HEIGHT).count();

    SampledHeights {
        heights,
        invalid_count,
    }
}

/// Samples the imagery layers of a plan at the pixel centers of its finest level.
///
/// Pixels no layer covers get `no_data_color`. Returns `None` if no pixel is covered.
pub fn sample_imagery(
    layers: &[Box<dyn ImagerySource>],
    plan: &TilePlan,
    no_data_color: [u8; 4],
) -> Option<Array2<[u8; 4]>> {
    let size = plan.size as usize;
    let spacing = plan.area.size() / plan.size as f64;
    let layers = plan.layers.iter().map(|&index| &layers[index]).collect::<Vec<_>>();

    let rows = sample_grid(size, size, |row, column| {
        let point = DVec2::new(
            plan.area.left + (column as f64 + 0.5) * spacing.x,
            plan.area.top - (row as f64 + 0.5) * spacing.y,
        );

        layers.iter().filter_map(|layer| layer.color_at(point)).last()
    });

    if rows.iter().flatten().all(Option::is_none) {
        return None;
    }

    Some(Array2::from_shape_fn((size, size), |(row, column)| {
        rows[row][column].unwrap_or(no_data_color)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ElevationGrid, ImageryLayer};
    use glam::UVec2;
    use terrain_pyramid::math::WorldArea;

    fn plan(layers: Vec<usize>) -> TilePlan {
        TilePlan {
            tile: UVec2::ZERO,
            area: WorldArea::new(0.0, 0.0, 8.0, 8.0).unwrap(),
            size: 8,
            lod_count: 2,
            layers,
        }
    }

    fn constant(left: f64, bottom: f64, right: f64, top: f64, height: f32) -> Box<dyn ElevationSource> {
        let area = WorldArea::new(left, bottom, right, top).unwrap();
        Box::new(ElevationGrid::from_fn(area, UVec2::new(5, 5), |_| Some(height)).unwrap())
    }

    #[test]
    fn the_last_valid_layer_wins() {
        let layers = vec![
            constant(0.0, 0.0, 8.0, 8.0, 1.0),
            constant(0.0, 0.0, 4.0, 8.0, 2.0),
        ];

        let sampled = sample_heights(&layers, &plan(vec![0, 1]), SamplingPolicy::LastValid);

        assert_eq!(sampled.heights.dim(), (9, 9));
        assert!(sampled.is_complete());
        assert_eq!(sampled.heights[(3, 4)], 2.0);
        assert_eq!(sampled.heights[(3, 5)], 1.0);
        assert_eq!(sampled.height_range(), Some((1.0, 2.0)));

        let averaged = sample_heights(&layers, &plan(vec![0, 1]), SamplingPolicy::Average);
        assert_eq!(averaged.heights[(3, 4)], 1.5);
        assert_eq!(averaged.heights[(3, 5)], 1.0);
    }

    #[test]
    fn uncovered_samples_are_invalid() {
        let layers = vec![constant(0.0, 4.0, 8.0, 8.0, 3.0)];

        let sampled = sample_heights(&layers, &plan(vec![0]), SamplingPolicy::LastValid);

        // rows 0 to 4 lie inside the layer
        assert_eq!(sampled.invalid_count, 4 * 9);
        assert_eq!(sampled.heights[(4, 0)], 3.0);
        assert_eq!(sampled.heights[(5, 0)], INVALID_HEIGHT);
        assert!(!sampled.is_empty() && !sampled.is_complete() && !sampled.is_flat());
    }

    #[test]
    fn imagery_is_sampled_at_pixel_centers() {
        let area = WorldArea::new(0.0, 0.0, 4.0, 4.0).unwrap();
        let layers: Vec<Box<dyn ImagerySource>> = vec![Box::new(
            ImageryLayer::new(area, Array2::from_elem((2, 2), [10, 20, 30, 255])).unwrap(),
        )];

        let pixels = sample_imagery(&layers, &plan(vec![0]), [0; 4]).unwrap();

        assert_eq!(pixels.dim(), (8, 8));
        assert_eq!(pixels[(3, 3)], [0; 4]);
        assert_eq!(pixels[(4, 4)], [0; 4]);
        assert_eq!(pixels[(7, 3)], [10, 20, 30, 255]);
        assert_eq!(pixels.iter().filter(|&&pixel| pixel[3] == 255).count(), 16);

        assert!(sample_imagery(&layers, &plan(vec![]), [0; 4]).is_none());
    }
}
