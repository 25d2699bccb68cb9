//! Parallel build of a sharded database.  Keys are partitioned by hash, every shard has its own
//! builder owned by a dedicated thread fed through a channel, so adds return as soon as the pair
//! is queued and all shards finalize at the same time.

use crate::finalize_error::FinalizeError;
use crate::{
    current_generation, generation_dir, publish_generation, shard_for_key, shard_path,
    ShardedConfig,
};
use discodb_core::{ChdHash, DbBuilder, PerfectHash};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::*;

type ShardResult = Result<Option<usize>, discodb_core::error::finalize::FinalizeError>;

/// Commands that can be sent to a build thread.
pub(crate) enum BuildCommand {
    Add(Vec<u8>, Vec<u8>),
    /// Write the shard to the path, replies with the key count (None for an empty shard, nothing
    /// is written for it).
    Finalize(PathBuf, oneshot::Sender<ShardResult>),
}

/// Builds one artifact per shard into a directory.
pub struct ShardedBuilder {
    dir: PathBuf,
    config: ShardedConfig,
    build_txs: Vec<mpsc::Sender<BuildCommand>>,
    build_threads: Option<Vec<std::thread::JoinHandle<()>>>,
}

impl Drop for ShardedBuilder {
    fn drop(&mut self) {
        // Closing the channels ends the threads once they drain.
        self.build_txs.clear();
        if let Some(mut build_threads) = self.build_threads.take() {
            for build_thread in build_threads.drain(..) {
                let _ = build_thread.join();
            }
        }
    }
}

impl ShardedBuilder {
    /// Start a build into dir (created if needed).  Nothing is written to dir until finalize().
    pub fn new<P: AsRef<Path>>(dir: P, config: ShardedConfig) -> Result<Self, FinalizeError> {
        Self::new_with_hash::<P, ChdHash>(dir, config)
    }

    /// Start a build whose shards use the perfect hash H.
    pub fn new_with_hash<P, H>(dir: P, config: ShardedConfig) -> Result<Self, FinalizeError>
    where
        P: AsRef<Path>,
        H: PerfectHash + 'static,
    {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let shards = config.shards();
        let mut build_txs = Vec::with_capacity(shards);
        let mut build_threads = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (build_tx, build_rx) = mpsc::channel(config.channel_depth());
            let builder: DbBuilder<H> = config.db_config().clone().build();
            let build_thread = std::thread::spawn(move || build_thread(shard, builder, build_rx));
            build_threads.push(build_thread);
            build_txs.push(build_tx);
        }
        Ok(Self {
            dir,
            config,
            build_txs,
            build_threads: Some(build_threads),
        })
    }

    /// Directory the shards will be written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of shards.
    pub fn shards(&self) -> usize {
        self.build_txs.len()
    }

    /// Queue value for key on the owning shard.
    pub async fn add<K, V>(&self, key: K, value: V) -> Result<(), FinalizeError>
    where
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        let key = key.into();
        let shard = shard_for_key(&key, self.config.shard_bits());
        self.build_txs[shard]
            .send(BuildCommand::Add(key, value.into()))
            .await
            .map_err(|_| FinalizeError::SendChannelClosed)
    }

    /// Finalize every shard in parallel into a new generation and publish it.  Nothing that is
    /// already published changes unless every shard succeeds, a failed or empty build removes
    /// only its own files.  Returns the total key count.
    pub async fn finalize(self) -> Result<u64, FinalizeError> {
        let previous = current_generation(&self.dir)?;
        let generation = previous.map_or(1, |g| g + 1);
        let gen_dir = generation_dir(&self.dir, generation);
        if gen_dir.exists() {
            // Left by a build that never published.
            fs::remove_dir_all(&gen_dir)?;
        }
        fs::create_dir_all(&gen_dir)?;
        let res = self.finalize_shards(&gen_dir).await.and_then(|keys| {
            publish_generation(&self.dir, generation)?;
            Ok(keys)
        });
        let keys = match res {
            Ok(keys) => keys,
            Err(err) => {
                remove_generation(&gen_dir);
                return Err(err);
            }
        };
        if let Some(previous) = previous {
            remove_generation(&generation_dir(&self.dir, previous));
        }
        info!(
            "published {} shards to {}, {} keys",
            self.shards(),
            gen_dir.display(),
            keys
        );
        Ok(keys)
    }

    async fn finalize_shards(&self, gen_dir: &Path) -> Result<u64, FinalizeError> {
        let mut result = Ok(());
        let mut rxs = Vec::with_capacity(self.build_txs.len());
        for (shard, build_tx) in self.build_txs.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            let path = shard_path(gen_dir, self.config.shard_bits(), shard);
            if build_tx
                .send(BuildCommand::Finalize(path, tx))
                .await
                .is_err()
            {
                result = Err(FinalizeError::SendChannelClosed);
                break;
            }
            rxs.push(rx);
        }
        // Wait for every shard that started writing, even after a failure.
        let mut keys = 0_u64;
        for (shard, rx) in rxs.drain(..).enumerate() {
            match rx.await {
                Ok(Ok(Some(count))) => keys += count as u64,
                Ok(Ok(None)) => {}
                Ok(Err(err)) => result = Err(FinalizeError::Shard(shard, err)),
                Err(_err) => result = Err(FinalizeError::ReceiveFailed),
            }
        }
        result?;
        if keys == 0 {
            return Err(FinalizeError::EmptyInput);
        }
        Ok(keys)
    }
}

fn remove_generation(gen_dir: &Path) {
    if let Err(err) = fs::remove_dir_all(gen_dir) {
        warn!("failed to remove {}: {}", gen_dir.display(), err);
    }
}

/// Run a background thread that owns the builder for one shard.
fn build_thread<H: PerfectHash>(
    shard: usize,
    mut builder: DbBuilder<H>,
    mut build_rx: mpsc::Receiver<BuildCommand>,
) {
    while let Some(command) = build_rx.blocking_recv() {
        match command {
            BuildCommand::Add(key, value) => {
                builder.add(key, value);
            }
            BuildCommand::Finalize(path, tx) => {
                let res = if builder.is_empty() {
                    Ok(None)
                } else {
                    builder
                        .finalize_to_path(&path)
                        .map(|_| Some(builder.len()))
                };
                let _ = tx.send(res);
            }
        }
    }
    debug!("shard {} build thread done", shard);
}
