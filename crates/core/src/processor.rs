//! Bounded concurrent block upscaling.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::collaborators::BlockUpscaler;
use crate::error::PipelineError;
use crate::slicer::Block;
use crate::types::ModelOutput;

#[derive(Debug, Clone, Copy)]
struct BlockId {
    index: usize,
    grid_row: usize,
    grid_col: usize,
}

impl BlockId {
    fn of(block: &Block) -> Self {
        Self {
            index: block.index,
            grid_row: block.grid_row,
            grid_col: block.grid_col,
        }
    }

    fn failure(self) -> PipelineError {
        PipelineError::BlockFailed {
            index: self.index,
            grid_row: self.grid_row,
            grid_col: self.grid_col,
        }
    }
}

/// Runs the upscaler over a grid of blocks with at most `max_concurrent`
/// blocking tasks in flight.
///
/// Every call also holds a permit from `permits`, which is shared by all
/// processors built from the same resource handle, so the process-wide
/// number of in-flight upscaler calls never exceeds its capacity.
pub struct BlockProcessor {
    max_concurrent: usize,
    permits: Arc<Semaphore>,
}

impl BlockProcessor {
    pub fn new(max_concurrent: usize, permits: Arc<Semaphore>) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            permits,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Upscale every block and return the outputs in submission order.
    ///
    /// The first failing block aborts the remaining work; its error is
    /// returned with a [`PipelineError::BlockFailed`] context naming the
    /// block. Calls that are already running are left to finish on their
    /// own and their results are dropped.
    pub async fn process(
        &self,
        blocks: Vec<Block>,
        upscaler: Arc<dyn BlockUpscaler>,
    ) -> Result<Vec<ModelOutput>> {
        let total = blocks.len();
        let started = Instant::now();
        debug!(
            blocks = total,
            max_concurrent = self.max_concurrent,
            "Upscaling blocks"
        );

        let mut results: Vec<Option<ModelOutput>> = (0..total).map(|_| None).collect();
        let mut pending = blocks.into_iter();
        let mut tasks: JoinSet<(BlockId, Result<ModelOutput>)> = JoinSet::new();

        loop {
            while tasks.len() < self.max_concurrent {
                let Some(block) = pending.next() else {
                    break;
                };
                let permit = Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .context("block permit pool was closed")?;
                let upscaler = Arc::clone(&upscaler);
                tasks.spawn_blocking(move || {
                    let _permit = permit;
                    let id = BlockId::of(&block);
                    let call_started = Instant::now();
                    let result = upscaler.upscale(&block);
                    trace!(
                        index = id.index,
                        elapsed_ms = call_started.elapsed().as_millis() as u64,
                        "Block upscaled"
                    );
                    (id, result)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (id, result) = match joined {
                Ok(done) => done,
                Err(join_error) => {
                    tasks.abort_all();
                    return Err(anyhow::Error::new(join_error).context(PipelineError::TaskJoin {
                        stage: "upscale_blocks",
                    }));
                }
            };

            match result {
                Ok(output) => results[id.index] = Some(output),
                Err(error) => {
                    tasks.abort_all();
                    warn!(
                        index = id.index,
                        grid_row = id.grid_row,
                        grid_col = id.grid_col,
                        error = %format!("{error:#}"),
                        "Block upscale failed, aborting remaining blocks"
                    );
                    return Err(error.context(id.failure()));
                }
            }
        }

        let outputs = results
            .into_iter()
            .enumerate()
            .map(|(index, output)| {
                output.ok_or_else(|| {
                    anyhow::Error::new(PipelineError::InvalidGeometry(format!(
                        "block {index} produced no output"
                    )))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            blocks = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscaled all blocks"
        );
        Ok(outputs)
    }
}
