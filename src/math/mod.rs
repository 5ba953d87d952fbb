//! World and tile coordinates.

mod coordinate;

pub use coordinate::{TileCoordinate, WorldArea};
