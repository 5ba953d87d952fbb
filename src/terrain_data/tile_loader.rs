use crate::{formats::tdf::TDF, math::TileCoordinate, terrain_data::TileRaster};
use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use std::{
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};
use tracing::{debug, trace};

pub(crate) struct LoadRequest {
    pub(crate) ticket: usize,
    pub(crate) request: u64,
    pub(crate) coordinate: TileCoordinate,
    pub(crate) path: PathBuf,
}

pub(crate) struct LoadedTile {
    pub(crate) ticket: usize,
    pub(crate) request: u64,
    pub(crate) coordinate: TileCoordinate,
    pub(crate) raster: Result<TileRaster>,
}

/// Reads and decodes a tile blob.
pub(crate) fn load_tile(path: &Path) -> Result<TileRaster> {
    let (_, raster) = TDF::load_file(path)?;
    Ok(raster)
}

/// A pool of worker threads that decode tile blobs in the background.
///
/// Decoded tiles are handed back through a channel and only become visible once the cache
/// inserts them.
pub(crate) struct TileLoader {
    requests: Sender<LoadRequest>,
    loaded: Receiver<LoadedTile>,
    workers: Vec<JoinHandle<()>>,
}

impl TileLoader {
    pub(crate) fn new(worker_count: usize) -> Result<Self> {
        let (requests, request_receiver) = async_channel::unbounded::<LoadRequest>();
        let (loaded_sender, loaded) = async_channel::unbounded();

        let workers = (0..worker_count)
            .map(|index| {
                let requests = request_receiver.clone();
                let loaded = loaded_sender.clone();

                thread::Builder::new()
                    .name(format!("tile-loader-{index}"))
                    .spawn(move || {
                        while let Ok(request) = requests.recv_blocking() {
                            trace!("loading tile {}", request.coordinate);

                            let tile = LoadedTile {
                                ticket: request.ticket,
                                request: request.request,
                                coordinate: request.coordinate,
                                raster: load_tile(&request.path),
                            };

                            if loaded.send_blocking(tile).is_err() {
                                break;
                            }
                        }
                    })
                    .context("could not spawn a tile loader thread")
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("started {worker_count} tile loader threads");

        Ok(Self {
            requests,
            loaded,
            workers,
        })
    }

    pub(crate) fn request(&self, request: LoadRequest) -> Result<()> {
        self.requests
            .try_send(request)
            .map_err(|_| anyhow::anyhow!("the tile loader has shut down"))
    }

    /// Returns the next decoded tile without waiting.
    pub(crate) fn try_loaded(&self) -> Option<LoadedTile> {
        self.loaded.try_recv().ok()
    }
}

impl Drop for TileLoader {
    fn drop(&mut self) {
        self.requests.close();
        self.loaded.close();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
