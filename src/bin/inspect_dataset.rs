//! Scan the datasets of a training config and report what the trainer would see:
//! usable/skipped image counts, bucket table and batches per epoch.

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use eritrain::data::DataLoader;
use eritrain::trainers::checkpoint::CheckpointManager;

#[derive(Parser, Debug)]
#[command(name = "inspect_dataset", about = "Inspect the datasets and saves of a training config")]
struct Args {
    /// Path to the YAML or JSON job config
    config: PathBuf,

    /// Only inspect the process with this index
    #[arg(long)]
    process: Option<usize>,

    /// Decode this many batches of each loader to check the images load
    #[arg(long, default_value_t = 0)]
    decode: usize,
}

fn main() -> Result<()> {
    eritrain::logging::init_logger();
    let args = Args::parse();

    let config = eritrain::load_config(&args.config)?;
    let job_name = &config.config.name;
    info!("Job: {} ({} processes)", job_name, config.config.process.len());

    for (idx, process) in config.config.process.iter().enumerate() {
        if args.process.is_some_and(|p| p != idx) {
            continue;
        }
        info!("Process {}: {}", idx, process.process_type);

        let train = {
            let mut train = process.train.clone();
            train.num_workers = Some(0);
            train
        };
        for (name, datasets) in [("train", process.primary_datasets()), ("reg", process.reg_datasets())] {
            let Some(loader) = DataLoader::new(name, &datasets, &train)? else {
                continue;
            };
            for dataset in loader.datasets() {
                let stats = dataset.stats();
                info!(
                    "{}: {} usable, {} too small, {} unreadable, {} {} per epoch",
                    dataset.config().folder_path.display(),
                    stats.found,
                    stats.too_small,
                    stats.unreadable,
                    dataset.len(),
                    if dataset.is_bucketed() { "batches" } else { "images" }
                );
            }
            info!("{} loader: {} batches per epoch at batch size {}", name, loader.len(), train.batch_size);

            for (i, batch) in loader.iter_epoch().take(args.decode).enumerate() {
                let batch = batch?;
                info!(
                    "  batch {}: {:?}, first prompt: {:?}",
                    i,
                    batch.images.dims(),
                    batch.prompts.as_ref().and_then(|p| p.first())
                );
            }
        }

        let checkpoints =
            CheckpointManager::new(process.save_root(job_name), job_name, process.save.max_step_saves_to_keep);
        match checkpoints.latest_save_path()? {
            Some(path) => {
                let step = eritrain::trainers::checkpoint::read_saved_step(&path)?;
                info!("Latest save: {} (step {:?})", path.display(), step);
            }
            None => info!("No saves yet in {}", checkpoints.save_root.display()),
        }
    }
    Ok(())
}
