/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::collections::VecDeque;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, SystemTime};

use super::cooldown::Cooldown;
use super::Worker;
use crate::events::{CooldownKind, Event, UploadPieceEvent, WorkerCooldownEvent};
use crate::upload::{PieceClaim, UnfinishedUploadChunk};

/// Chunks offered to the worker that it has not looked at yet.
#[derive(Default)]
pub(crate) struct UploadQueue {
    pub(crate) chunks: VecDeque<Arc<UnfinishedUploadChunk>>,
    pub(crate) cooldown: Cooldown,
    pub(crate) terminated: bool,
}

impl Worker {
    fn upload_queue(&self) -> MutexGuard<'_, UploadQueue> {
        self.upload.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn upload_cooldown_base(&self) -> (Duration, u32) {
        (self.env.config.upload_failure_cooldown, self.env.config.max_consecutive_penalty)
    }

    /// Offer `chunk` to the worker. The chunk is dropped at once if the worker cannot take a piece of it.
    pub(crate) fn queue_upload_chunk(&self, chunk: Arc<UnfinishedUploadChunk>) {
        let cache = self.cache();
        let (base, max_penalty) = self.upload_cooldown_base();
        let accepted = {
            let mut queue = self.upload_queue();
            let eligible = cache.contract_id.is_some()
                && cache.utility.good_for_upload
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

    pub(crate) fn has_upload_job(&self) -> bool {
        let (base, max_penalty) = self.upload_cooldown_base();
        let queue = self.upload_queue();
        !queue.chunks.is_empty() && !queue.cooldown.is_active(base, max_penalty)
    }

    /// Upload one piece of the next queued chunk.
    pub(crate) fn perform_upload_chunk_job(self: &Arc<Self>) {
        let chunk = match self.upload_queue().chunks.pop_front() {
            Some(chunk) => chunk,
            None => return,
        };
        // A worker that lost its contract or upload utility since queueing hands the chunk back.
        let cache = self.cache();
        if cache.contract_id.is_none() || !cache.utility.good_for_upload {
            chunk.drop_worker();
            return;
        }
        let (piece_index, data) = match chunk.claim_piece(self) {
            PieceClaim::Piece(piece_index, data) => (piece_index, data),
            PieceClaim::Standby | PieceClaim::Drop => return,
        };

        let result = self
            .upload_sector(&data)
            .and_then(|root| {
                chunk
                    .file()
                    .add_piece(self.host, chunk.index(), piece_index as u64, root)
                    .map(|()| root)
            });
        match result {
            Ok(root) => {
                self.upload_queue().cooldown.record_success();
                Event::publish(
                    &self.env.event_publisher,
                    Event::UploadPiece(UploadPieceEvent {
                        timestamp: SystemTime::now(),
                        host: self.host,
                        path: chunk.file().path().to_string(),
                        chunk_index: chunk.index(),
                        piece_index: piece_index as u64,
                        root,
                    }),
                );
                chunk.piece_uploaded();
            }
            Err(err) => {
                log::debug!(
                    "Worker for host {} failed to upload piece {} of chunk {} of {}: {}",
                    self.host,
                    piece_index,
                    chunk.index(),
                    chunk.file().path(),
                    err
                );
                let (base, max_penalty) = self.upload_cooldown_base();
                let (consecutive_failures, cooldown, dropped) = {
                    let mut queue = self.upload_queue();
                    let (failures, cooldown) = queue.cooldown.record_failure(err.to_string(), base, max_penalty);
                    (failures, cooldown, std::mem::take(&mut queue.chunks))
                };
                Event::publish(
                    &self.env.event_publisher,
                    Event::WorkerCooldown(WorkerCooldownEvent {
                        timestamp: SystemTime::now(),
                        host: self.host,
                        kind: CooldownKind::Upload,
                        consecutive_failures,
                        cooldown,
                    }),
                );
                chunk.piece_failed(piece_index, data);
                for dropped in dropped {
                    dropped.drop_worker();
                }
            }
        }
    }

    /// Refuse new chunks and hand back the queued ones.
    pub(crate) fn kill_uploading(&self) {
        let dropped = {
            let mut queue = self.upload_queue();
            queue.terminated = true;
            std::mem::take(&mut queue.chunks)
        };
        for chunk in dropped {
            chunk.drop_worker();
        }
    }
}
