use crate::{
    dataset::GapFillMethod,
    result::{PreprocessError, PreprocessResult},
};
use itertools::iproduct;
use ndarray::Array2;
use rayon::prelude::*;
use terrain_pyramid::{math::TileCoordinate, terrain_data::INVALID_HEIGHT};

const NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

const SMOOTH_TOLERANCE: f32 = 1e-3;
const SMOOTH_MAX_ITERATIONS: usize = 500;

fn is_valid(height: f32) -> bool {
    height != INVALID_HEIGHT
}

fn offset(heights: &Array2<f32>, (row, column): (usize, usize), (dx, dy): (isize, isize), distance: isize) -> Option<f32> {
    let row = row.checked_add_signed(dy * distance)?;
    let column = column.checked_add_signed(dx * distance)?;

    heights.get((row, column)).copied().filter(|&height| is_valid(height))
}

/// The indices of all invalid samples in row-major order.
fn gaps(heights: &Array2<f32>) -> Vec<(usize, usize)> {
    iproduct!(0..heights.nrows(), 0..heights.ncols())
        .filter(|&index| !is_valid(heights[index]))
        .collect()
}

/// Computes the value of every candidate next to a valid sample, without modifying the grid.
///
/// The updates of a pass are applied together, so results do not depend on the visiting
/// order or on the number of threads.
fn grow_ring(
    heights: &Array2<f32>,
    candidates: &[(usize, usize)],
    estimate: impl Fn(&Array2<f32>, (usize, usize)) -> Option<f32> + Sync,
) -> Vec<((usize, usize), f32)> {
    candidates
        .par_iter()
        .filter_map(|&index| estimate(heights, index).map(|value| (index, value)))
        .collect()
}

/// The invalid samples next to the ones filled by the last pass.
/// Only these can be reached by the following pass.
fn next_ring(heights: &Array2<f32>, filled: &[((usize, usize), f32)]) -> Vec<(usize, usize)> {
    let mut ring = filled
        .iter()
        .flat_map(|&((row, column), _)| {
            NEIGHBOURS.iter().filter_map(move |&(dx, dy)| {
                Some((row.checked_add_signed(dy)?, column.checked_add_signed(dx)?))
            })
        })
        .filter(|&index| heights.get(index).is_some_and(|&height| !is_valid(height)))
        .collect::<Vec<_>>();

    ring.sort_unstable();
    ring.dedup();
    ring
}

/// Grows the valid region one ring per pass, until a pass fills nothing.
/// Returns `None` if invalid samples remain.
fn grow(
    heights: &mut Array2<f32>,
    estimate: impl Fn(&Array2<f32>, (usize, usize)) -> Option<f32> + Sync,
    limit: impl Fn(f32) -> f32,
) -> Option<usize> {
    let mut candidates = gaps(heights);
    let mut filled = 0;

    while !candidates.is_empty() {
        let updates = grow_ring(heights, &candidates, &estimate);

        if updates.is_empty() {
            return None;
        }

        filled += updates.len();

        for &(index, value) in &updates {
            heights[index] = limit(value);
        }

        candidates = next_ring(heights, &updates);
    }

    heights.iter().all(|&height| is_valid(height)).then_some(filled)
}

fn neighbour_mean(heights: &Array2<f32>, index: (usize, usize)) -> Option<f32> {
    let (sum, count) = NEIGHBOURS
        .iter()
        .filter_map(|&direction| offset(heights, index, direction, 1))
        .fold((0.0, 0), |(sum, count), height| (sum + height, count + 1));

    (count > 0).then(|| sum / count as f32)
}

fn extrapolated_mean(heights: &Array2<f32>, index: (usize, usize)) -> Option<f32> {
    let (sum, count) = NEIGHBOURS
        .iter()
        .filter_map(|&direction| {
            let near = offset(heights, index, direction, 1)?;

            Some(match offset(heights, index, direction, 2) {
                Some(far) => 2.0 * near - far,
                None => near,
            })
        })
        .fold((0.0, 0), |(sum, count), height| (sum + height, count + 1));

    (count > 0).then(|| sum / count as f32)
}

fn fill_fast(heights: &mut Array2<f32>) -> Option<usize> {
    grow(heights, neighbour_mean, |value| value)
}

fn fill_smooth(heights: &mut Array2<f32>) -> Option<usize> {
    let gaps = gaps(heights);
    let filled = fill_fast(heights)?;

    for _ in 0..SMOOTH_MAX_ITERATIONS {
        let relaxed = gaps
            .par_iter()
            .map(|&(row, column)| {
                let (sum, count) = [(0, -1), (-1, 0), (1, 0), (0, 1)]
                    .into_iter()
                    .filter_map(|direction| offset(heights, (row, column), direction, 1))
                    .fold((0.0, 0), |(sum, count), height| (sum + height, count + 1));

                sum / count as f32
            })
            .collect::<Vec<_>>();

        let mut max_change: f32 = 0.0;

        for (&index, value) in gaps.iter().zip(relaxed) {
            max_change = max_change.max((heights[index] - value).abs());
            heights[index] = value;
        }

        if max_change < SMOOTH_TOLERANCE {
            break;
        }
    }

    Some(filled)
}

/// Extrapolated values are clamped to the range of the valid samples.
fn fill_region_growing(heights: &mut Array2<f32>) -> Option<usize> {
    let (low, high) = heights
        .iter()
        .copied()
        .filter(|&height| is_valid(height))
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(low, high), height| {
            (low.min(height), high.max(height))
        });

    grow(heights, extrapolated_mean, |value| value.clamp(low, high))
}

/// Replaces every invalid sample of a tile with an estimate from its valid surroundings.
///
/// Returns the number of filled samples. Fails if the tile has no valid sample to grow from.
pub fn fill_gaps(
    heights: &mut Array2<f32>,
    method: GapFillMethod,
    tile: TileCoordinate,
) -> PreprocessResult<usize> {
    let filled = match method {
        GapFillMethod::Fast => fill_fast(heights),
        GapFillMethod::Smooth => fill_smooth(heights),
        GapFillMethod::RegionGrowing => fill_region_growing(heights),
    };

    filled.ok_or(PreprocessError::GapFillFailure { tile })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const X: f32 = INVALID_HEIGHT;

    fn random_gaps(fraction: f64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(7);

        Array2::from_shape_fn((33, 33), |(row, column)| {
            if rng.random_bool(fraction) {
                X
            } else {
                (row * 3 + column) as f32
            }
        })
    }

    #[test]
    fn fast_fill_uses_the_mean_of_valid_neighbours() {
        let mut heights = array![[1.0, 3.0, X], [X, X, X], [X, X, X]];

        let filled = fill_gaps(&mut heights, GapFillMethod::Fast, TileCoordinate::INVALID).unwrap();

        assert_eq!(filled, 7);
        assert_eq!(heights[(0, 2)], 3.0);
        assert_eq!(heights[(1, 0)], 2.0);
        assert_eq!(heights[(1, 1)], 2.0);
        assert!(heights.iter().all(|&height| is_valid(height)));
    }

    #[test]
    fn no_invalid_samples_remain() {
        for method in [GapFillMethod::Fast, GapFillMethod::Smooth, GapFillMethod::RegionGrowing] {
            let mut heights = random_gaps(0.4);
            let invalid = heights.iter().filter(|&&height| height == X).count();

            let filled = fill_gaps(&mut heights, method, TileCoordinate::INVALID).unwrap();

            assert_eq!(filled, invalid);
            assert!(heights.iter().all(|&height| is_valid(height)));
        }
    }

    #[test]
    fn valid_samples_are_untouched() {
        let original = random_gaps(0.3);

        for method in [GapFillMethod::Fast, GapFillMethod::Smooth, GapFillMethod::RegionGrowing] {
            let mut heights = original.clone();
            fill_gaps(&mut heights, method, TileCoordinate::INVALID).unwrap();

            for (&before, &after) in original.iter().zip(heights.iter()) {
                if before != X {
                    assert_eq!(before, after);
                }
            }
        }
    }

    #[test]
    fn region_growing_extrapolates_slopes() {
        let mut heights = array![[0.0, 1.0, 2.0, X], [0.0, 1.0, 2.0, X], [0.0, 1.0, 2.0, X]];

        fill_gaps(&mut heights, GapFillMethod::RegionGrowing, TileCoordinate::INVALID).unwrap();

        // extrapolation beyond the valid range is clamped to it
        assert_eq!(heights.column(3).to_vec(), vec![2.0, 2.0, 2.0]);

        let mut heights = array![[4.0, 1.0, 2.0, X], [0.0, 1.0, 2.0, X], [0.0, 1.0, 2.0, X]];
        fill_gaps(&mut heights, GapFillMethod::RegionGrowing, TileCoordinate::INVALID).unwrap();

        assert_eq!(heights[(0, 3)], 3.0);
        assert_eq!(heights[(2, 3)], 3.0);
    }

    #[test]
    fn region_growing_reaches_the_far_corner() {
        let mut heights = Array2::from_elem((513, 513), X);
        heights[(512, 0)] = 5.0;
        heights[(511, 0)] = 4.0;

        let filled = fill_gaps(&mut heights, GapFillMethod::RegionGrowing, TileCoordinate::INVALID).unwrap();

        assert_eq!(filled, 513 * 513 - 2);
        assert!(heights.iter().all(|&height| (4.0..=5.0).contains(&height)));
    }

    #[test]
    fn tiles_without_valid_samples_can_not_be_filled() {
        for method in [GapFillMethod::Fast, GapFillMethod::Smooth, GapFillMethod::RegionGrowing] {
            let mut heights = Array2::from_elem((5, 5), X);
            let tile = TileCoordinate::new(1, 2, 3);

            assert!(matches!(
                fill_gaps(&mut heights, method, tile),
                Err(PreprocessError::GapFillFailure { tile: failed }) if failed == tile
            ));
        }
    }

    #[test]
    fn smooth_fill_blends_into_the_surroundings() {
        let mut heights = Array2::from_shape_fn((5, 5), |(_, column)| column as f32);
        heights[(2, 2)] = X;
        heights[(2, 1)] = X;

        fill_gaps(&mut heights, GapFillMethod::Smooth, TileCoordinate::INVALID).unwrap();

        assert!((heights[(2, 1)] - 1.0).abs() < 0.01);
        assert!((heights[(2, 2)] - 2.0).abs() < 0.01);
    }
}
