use glam::{DVec2, UVec2};
use itertools::iproduct;
use terrain_pyramid::{math::WorldArea, terrain_data::lod_map::LodRange};

/// Tiles are refined while their sample spacing is coarser than this factor times the
/// finest source spacing.
const SPACING_MARGIN: f64 = 1.1;

/// The extent and sample spacing of a source layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerFootprint {
    pub extent: WorldArea,
    pub spacing: DVec2,
}

impl LayerFootprint {
    pub fn new(extent: WorldArea, spacing: DVec2) -> Self {
        Self { extent, spacing }
    }
}

/// The partition of an area into a grid of tiles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileGrid {
    pub area: WorldArea,
    pub columns: u32,
    pub rows: u32,
    /// The edge length in cells of the finest level of detail.
    pub lod0_size: u32,
    /// The maximum number of levels per tile.
    pub lod_count: u32,
}

impl TileGrid {
    pub fn tile_count(&self) -> UVec2 {
        UVec2::new(self.columns, self.rows)
    }

    pub fn coarsest_size(&self) -> u32 {
        self.lod0_size >> (self.lod_count - 1)
    }
}

/// How much detail to generate for a tile and from which layers.
#[derive(Clone, Debug, PartialEq)]
pub struct TilePlan {
    pub tile: UVec2,
    pub area: WorldArea,
    /// The edge length in cells of the finest level generated for this tile.
    pub size: u32,
    pub lod_count: u32,
    /// The indices of the overlapping layers, in input order.
    pub layers: Vec<usize>,
}

impl TilePlan {
    pub fn lod_range(&self) -> LodRange {
        let highest = self.size.trailing_zeros();
        LodRange::new(highest, highest + 1 - self.lod_count)
    }
}

/// Plans every tile of the grid that overlaps at least one layer, in row-major order.
/// Tiles without any overlapping layer are omitted.
pub fn plan_tiles(grid: &TileGrid, layers: &[LayerFootprint]) -> Vec<TilePlan> {
    let coarsest_size = grid.coarsest_size();

    iproduct!(0..grid.rows, 0..grid.columns)
        .filter_map(|(row, column)| {
            let area = grid.area.tile_area(grid.tile_count(), column, row);

            let overlapping = layers
                .iter()
                .enumerate()
                .filter(|(_, layer)| layer.extent.overlaps(&area))
                .map(|(index, _)| index)
                .collect::<Vec<_>>();

            let best_spacing = overlapping
                .iter()
                .map(|&index| layers[index].spacing.min_element())
                .reduce(f64::min)?;

            let mut size = coarsest_size;

            while size < grid.lod0_size && area.width() / size as f64 > best_spacing * SPACING_MARGIN {
                size *= 2;
            }

            Some(TilePlan {
                tile: UVec2::new(column, row),
                area,
                size,
                lod_count: size.trailing_zeros() - coarsest_size.trailing_zeros() + 1,
                layers: overlapping,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> TileGrid {
        TileGrid {
            area: WorldArea::new(0.0, 0.0, 1000.0, 1000.0).unwrap(),
            columns: 2,
            rows: 2,
            lod0_size: 256,
            lod_count: 3,
        }
    }

    fn footprint(left: f64, bottom: f64, right: f64, top: f64, spacing: f64) -> LayerFootprint {
        LayerFootprint::new(
            WorldArea::new(left, bottom, right, top).unwrap(),
            DVec2::splat(spacing),
        )
    }

    #[test]
    fn tiles_without_layers_are_omitted() {
        let plans = plan_tiles(&grid(), &[footprint(0.0, 500.0, 500.0, 1000.0, 1.0)]);

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].tile, UVec2::new(0, 0));
        assert_eq!(plans[0].size, 256);
        assert_eq!(plans[0].lod_count, 3);
        assert_eq!(plans[0].lod_range(), LodRange::new(8, 6));
        assert_eq!(plans[0].layers, vec![0]);
    }

    #[test]
    fn coarse_sources_generate_fewer_levels() {
        // a tile is 500 units wide, so 64 cells have a spacing of about 7.8 units
        let plans = plan_tiles(&grid(), &[footprint(0.0, 0.0, 1000.0, 1000.0, 8.0)]);
        assert!(plans.iter().all(|plan| plan.size == 64 && plan.lod_count == 1));

        let plans = plan_tiles(&grid(), &[footprint(0.0, 0.0, 1000.0, 1000.0, 4.0)]);
        assert!(plans.iter().all(|plan| plan.size == 128 && plan.lod_count == 2));
    }

    #[test]
    fn the_finest_overlapping_layer_decides() {
        let layers = [
            footprint(0.0, 0.0, 1000.0, 1000.0, 8.0),
            footprint(600.0, 0.0, 700.0, 100.0, 0.5),
        ];
        let plans = plan_tiles(&grid(), &layers);

        assert_eq!(plans.len(), 4);
        assert_eq!(plans[3].tile, UVec2::new(1, 1));
        assert_eq!(plans[3].size, 256);
        assert_eq!(plans[3].layers, vec![0, 1]);
        assert!(plans[..3].iter().all(|plan| plan.size == 64));
    }
}
