/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::collections::VecDeque;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, SystemTime};

use super::cooldown::Cooldown;
use super::Worker;
use crate::download::{DownloadClaim, UnfinishedDownloadChunk};
use crate::events::{CooldownKind, Event, WorkerCooldownEvent};

#[derive(Default)]
pub(crate) struct DownloadQueue {
    pub(crate) chunks: VecDeque<Arc<UnfinishedDownloadChunk>>,
    pub(crate) cooldown: Cooldown,
    pub(crate) terminated: bool,
}

impl Worker {
    fn download_queue(&self) -> MutexGuard<'_, DownloadQueue> {
        self.download.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn download_cooldown_base(&self) -> (Duration, u32) {
        (self.env.config.download_failure_cooldown, self.env.config.max_consecutive_penalty)
    }

    /// Offer `chunk` to the worker. Contracts that are not good for upload still serve downloads.
    pub(crate) fn queue_download_chunk(&self, chunk: Arc<UnfinishedDownloadChunk>) {
        let cache = self.cache();
        let (base, max_penalty) = self.download_cooldown_base();
        let accepted = {
            let mut queue = self.download_queue();
            let eligible = cache.contract_id.is_some()
                && !cache.utility.bad_contract
                && !queue.terminated
                && !queue.cooldown.is_active(base, max_penalty)
                && chunk.is_candidate(&self.host);
            if eligible {
                queue.chunks.push_back(chunk.clone());
            }
            eligible
        };
        if accepted {
            self.wake();
        } else {
            chunk.drop_worker();
        }
    }

    pub(crate) fn has_download_job(&self) -> bool {
        let (base, max_penalty) = self.download_cooldown_base();
        let queue = self.download_queue();
        !queue.chunks.is_empty() && !queue.cooldown.is_active(base, max_penalty)
    }

    /// Fetch one piece of the next queued chunk.
    pub(crate) fn perform_download_chunk_job(self: &Arc<Self>) {
        let chunk = match self.download_queue().chunks.pop_front() {
            Some(chunk) => chunk,
            None => return,
        };
        let (piece_index, root) = match chunk.claim_piece(self) {
            DownloadClaim::Piece(piece_index, root) => (piece_index, root),
            DownloadClaim::Standby | DownloadClaim::Drop => return,
        };

        match self.read_sector(&root, 0, chunk.piece_size()) {
            Ok(data) => {
                self.download_queue().cooldown.record_success();
                chunk.piece_downloaded(piece_index, data);
            }
            Err(err) => {
                log::debug!(
                    "Worker for host {} failed to download piece {} of chunk {} of {}: {}",
                    self.host,
                    piece_index,
                    chunk.index(),
                    chunk.path(),
                    err
                );
                let (base, max_penalty) = self.download_cooldown_base();
                let (consecutive_failures, cooldown, dropped) = {
                    let mut queue = self.download_queue();
                    let (failures, cooldown) = queue.cooldown.record_failure(err.to_string(), base, max_penalty);
                    (failures, cooldown, std::mem::take(&mut queue.chunks))
                };
                Event::publish(
                    &self.env.event_publisher,
                    Event::WorkerCooldown(WorkerCooldownEvent {
                        timestamp: SystemTime::now(),
                        host: self.host,
                        kind: CooldownKind::Download,
                        consecutive_failures,
                        cooldown,
                    }),
                );
                chunk.piece_failed(piece_index);
                for dropped in dropped {
                    dropped.drop_worker();
                }
            }
        }
    }

    pub(crate) fn kill_downloading(&self) {
        let dropped = {
            let mut queue = self.download_queue();
            queue.terminated = true;
            std::mem::take(&mut queue.chunks)
        };
        for chunk in dropped {
            chunk.drop_worker();
        }
    }
}
