use terrain_pyramid::terrain_data::TileData;

/// Derives all levels of a tile from its finest level, ordered from coarsest to finest.
///
/// Level `k` steps below the finest keeps every `2^k`-th sample along both axes, so each
/// coarser level is a strided subset of the finest one and no sample is ever filtered.
pub fn decimate(finest: &TileData, lod_count: u32) -> Vec<TileData> {
    (0..lod_count)
        .rev()
        .map(|steps| finest.subsample(1 << steps))
        .collect()
}
