//! Batch loading with a bounded prefetch queue
//!
//! An epoch is a shuffled list of jobs. Worker threads claim jobs through an
//! atomic cursor and push finished batches into a bounded channel; the
//! training loop blocks on the receiving end. With zero workers the jobs are
//! loaded on the calling thread.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::{DatasetConfig, TrainConfig};
use crate::data::{Batch, ImageDataset};
use crate::error::{config_error, TrainerError};

/// One unit of work: a precomputed bucket batch, or loose items to collate.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Job {
    Bucket { dataset: usize, batch_id: usize },
    Items(Vec<(usize, usize)>),
}

fn load_job(datasets: &[ImageDataset], job: &Job) -> Result<Batch> {
    let mut rng = rand::thread_rng();
    match job {
        Job::Bucket { dataset, batch_id } => datasets[*dataset].get_batch(*batch_id, &mut rng),
        Job::Items(items) => {
            let samples = items
                .iter()
                .map(|&(dataset, index)| datasets[dataset].get_sample(index, &mut rng))
                .collect::<Result<Vec<_>>>()?;
            Batch::collate(samples)
        }
    }
}

pub struct DataLoader {
    name: String,
    datasets: Arc<Vec<ImageDataset>>,
    batch_size: usize,
    num_workers: usize,
    prefetch_factor: usize,
    drop_last: bool,
    bucketed: bool,
}

impl DataLoader {
    /// Build one loader over `configs`. Returns `None` when there are none.
    pub fn new(name: &str, configs: &[DatasetConfig], train: &TrainConfig) -> Result<Option<Self>> {
        if configs.is_empty() {
            return Ok(None);
        }
        let bucketed = configs[0].buckets;
        if configs.iter().any(|c| c.buckets != bucketed) {
            return config_error("you either need all buckets or none");
        }

        let datasets = configs
            .iter()
            .map(|config| ImageDataset::new(config, train.batch_size))
            .collect::<Result<Vec<_>>>()?;

        let loader = Self {
            name: name.to_string(),
            datasets: Arc::new(datasets),
            batch_size: train.batch_size.max(1),
            num_workers: train.worker_count(),
            prefetch_factor: train.prefetch_factor.max(1),
            drop_last: train.drop_last,
            bucketed,
        };
        info!(
            "{} data loader: {} datasets, {} batches per epoch, {} workers",
            loader.name,
            loader.datasets.len(),
            loader.len(),
            loader.num_workers
        );
        Ok(Some(loader))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datasets(&self) -> &[ImageDataset] {
        &self.datasets
    }

    fn item_count(&self) -> usize {
        self.datasets.iter().map(|d| d.len()).sum()
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        if self.bucketed {
            return self.item_count();
        }
        let items = self.item_count();
        if self.drop_last {
            items / self.batch_size
        } else {
            items.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn epoch_jobs(&self) -> Vec<Job> {
        let mut rng = rand::thread_rng();
        if self.bucketed {
            let mut jobs: Vec<Job> = self
                .datasets
                .iter()
                .enumerate()
                .flat_map(|(dataset, d)| (0..d.len()).map(move |batch_id| Job::Bucket { dataset, batch_id }))
                .collect();
            jobs.shuffle(&mut rng);
            return jobs;
        }

        let mut items: Vec<(usize, usize)> = self
            .datasets
            .iter()
            .enumerate()
            .flat_map(|(dataset, d)| (0..d.len()).map(move |index| (dataset, index)))
            .collect();
        items.shuffle(&mut rng);
        items
            .chunks(self.batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == self.batch_size)
            .map(|chunk| Job::Items(chunk.to_vec()))
            .collect()
    }

    /// Start a fresh epoch.
    pub fn iter_epoch(&self) -> EpochIter {
        let jobs = self.epoch_jobs();
        if self.num_workers == 0 {
            return EpochIter {
                source: EpochSource::Inline {
                    datasets: Arc::clone(&self.datasets),
                    jobs: jobs.into(),
                },
            };
        }

        let jobs = Arc::new(jobs);
        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = bounded(self.num_workers * self.prefetch_factor);
        let handles = (0..self.num_workers)
            .map(|_| {
                let datasets = Arc::clone(&self.datasets);
                let jobs = Arc::clone(&jobs);
                let cursor = Arc::clone(&cursor);
                let tx = tx.clone();
                std::thread::spawn(move || loop {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(job) = jobs.get(idx) else {
                        break;
                    };
                    if tx.send(load_job(&datasets, job)).is_err() {
                        break;
                    }
                })
            })
            .collect();
        EpochIter {
            source: EpochSource::Workers {
                rx: Some(rx),
                handles,
            },
        }
    }
}

/// Batches of one epoch, in completion order when workers are used.
pub struct EpochIter {
    source: EpochSource,
}

enum EpochSource {
    Inline {
        datasets: Arc<Vec<ImageDataset>>,
        jobs: VecDeque<Job>,
    },
    Workers {
        rx: Option<Receiver<Result<Batch>>>,
        handles: Vec<JoinHandle<()>>,
    },
}

impl Iterator for EpochIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            EpochSource::Inline { datasets, jobs } => {
                let job = jobs.pop_front()?;
                Some(load_job(datasets.as_slice(), &job))
            }
            EpochSource::Workers { rx, .. } => rx.as_ref()?.recv().ok(),
        }
    }
}

impl Drop for EpochIter {
    fn drop(&mut self) {
        if let EpochSource::Workers { rx, handles } = &mut self.source {
            // workers blocked on a full queue see the disconnect and exit
            drop(rx.take());
            join_workers(handles.drain(..));
        }
    }
}

/// Wait for loader threads to exit. Returns how many of them panicked.
fn join_workers(handles: impl IntoIterator<Item = JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for handle in handles {
        if let Err(payload) = handle.join() {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!("Data loader worker panicked: {}", reason);
            panicked += 1;
        }
    }
    panicked
}

/// Endless batch source: restarts the loader's epoch whenever it runs dry.
pub struct BatchStream {
    loader: DataLoader,
    iter: Option<EpochIter>,
    epoch: usize,
}

impl BatchStream {
    pub fn new(loader: DataLoader) -> Self {
        Self {
            loader,
            iter: None,
            epoch: 0,
        }
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        if let Some(iter) = self.iter.as_mut() {
            if let Some(batch) = iter.next() {
                return batch;
            }
            self.iter = None;
            self.epoch += 1;
            debug!("{} data loader finished epoch {}", self.loader.name, self.epoch);
        }

        let iter = self.iter.insert(self.loader.iter_epoch());
        match iter.next() {
            Some(batch) => batch,
            None => Err(TrainerError::EmptyLoader(format!(
                "{} data loader yielded no batches in a fresh epoch",
                self.loader.name
            ))
            .into()),
        }
    }
}
