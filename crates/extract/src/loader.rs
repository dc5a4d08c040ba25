use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use ndarray::Array4;
use tracing::debug;

use crate::dataset::ImagesFromList;
use crate::ExtractError;

type Decoded = Result<Array4<f32>, ExtractError>;

/// Yields the images of a dataset in order, one at a time.
///
/// Decoding runs on the rayon pool: up to `num_workers` images past the one
/// the consumer holds are being decoded or waiting, so loading overlaps
/// whatever the consumer does with each image. Results arrive out of order
/// and are handed out by index.
pub struct Loader {
    dataset: Arc<ImagesFromList>,
    depth: usize,
    spawned: usize,
    yielded: usize,
    tx: Sender<(usize, Decoded)>,
    rx: Receiver<(usize, Decoded)>,
    arrived: HashMap<usize, Decoded>,
}

impl Loader {
    pub fn new(dataset: Arc<ImagesFromList>, num_workers: usize) -> Self {
        let (tx, rx) = channel();
        let mut loader = Self {
            dataset,
            depth: num_workers.max(1),
            spawned: 0,
            yielded: 0,
            tx,
            rx,
            arrived: HashMap::new(),
        };
        loader.top_up();
        loader
    }

    /// Keeps `depth` decodes ahead of the consumer.
    fn top_up(&mut self) {
        let end = (self.yielded + self.depth).min(self.dataset.len());
        if self.spawned < end {
            debug!(start = self.spawned, end, "prefetching images");
        }
        while self.spawned < end {
            let index = self.spawned;
            let dataset = Arc::clone(&self.dataset);
            let tx = self.tx.clone();
            rayon::spawn(move || {
                // The loader may be gone when an earlier image failed.
                let _ = tx.send((index, dataset.get(index)));
            });
            self.spawned += 1;
        }
    }
}

impl Iterator for Loader {
    type Item = Decoded;

    fn next(&mut self) -> Option<Self::Item> {
        if self.yielded == self.dataset.len() {
            return None;
        }
        let wanted = self.yielded;
        let item = loop {
            if let Some(item) = self.arrived.remove(&wanted) {
                break item;
            }
            // `self.tx` keeps the channel open, so this only waits.
            let (index, item) = self.rx.recv().ok()?;
            self.arrived.insert(index, item);
        };
        self.yielded += 1;
        self.top_up();
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.dataset.len() - self.yielded;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Loader {}
