//! The disk worker pool: a fixed number of threads pull `DiskJob`s off a
//! shared `crossbeam_channel` and report back through a per-job result
//! channel, keeping file I/O off the network thread.

use crate::disk::storage::FilePriority;
use crate::error::StorageError;
use crate::ids::TorrentId;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::path::PathBuf;
use std::thread::JoinHandle;

pub enum DiskJob {
    Read { torrent: TorrentId, piece: u32, offset: u32, len: u32, reply: Sender<Result<Vec<u8>, StorageError>> },
    Write { torrent: TorrentId, piece: u32, offset: u32, data: Vec<u8>, reply: Sender<Result<(), StorageError>> },
    HashPiece { torrent: TorrentId, piece: u32, data: Vec<u8>, reply: Sender<[u8; 20]> },
    ClearPiece { torrent: TorrentId, piece: u32, reply: Sender<Result<(), StorageError>> },
    FlushPiece { torrent: TorrentId, piece: u32, reply: Sender<Result<(), StorageError>> },
    FlushStorage { torrent: TorrentId, reply: Sender<Result<(), StorageError>> },
    ReleaseFiles { torrent: TorrentId, reply: Sender<Result<(), StorageError>> },
    DeleteFiles { torrent: TorrentId, reply: Sender<Result<(), StorageError>> },
    MoveStorage { torrent: TorrentId, new_path: PathBuf, reply: Sender<Result<(), StorageError>> },
    RenameFile { torrent: TorrentId, file_index: usize, new_name: String, reply: Sender<Result<(), StorageError>> },
    SetFilePriority { torrent: TorrentId, file_index: usize, priority: FilePriority, reply: Sender<()> },
    CheckFiles {
        torrent: TorrentId,
        piece_hashes: Vec<[u8; 20]>,
        piece_length: i64,
        reply: Sender<Result<Vec<bool>, StorageError>>,
    },
    StopTorrent { torrent: TorrentId, reply: Sender<Result<(), StorageError>> },
    Shutdown,
}

fn not_found() -> StorageError {
    StorageError { path_hint: None, source: std::io::Error::new(std::io::ErrorKind::NotFound, "torrent not found") }
}

/// Handed to the pool's worker closures; production code supplies a
/// per-torrent lookup into its live `Storage` handles, tests can stub this
/// out entirely.
pub trait StorageLookup: Send + Sync {
    fn with_storage<R>(&self, torrent: TorrentId, f: impl FnOnce(&mut dyn crate::disk::storage::Storage) -> R) -> Option<R>;
}

pub struct DiskWorkerPool {
    sender: Sender<DiskJob>,
    general_threads: usize,
    /// A dedicated channel `HashPiece` jobs are routed to instead of
    /// `sender`, so hashing never queues behind (or is starved by) general
    /// read/write work once one of these threads exists. `None` when the
    /// pool is too small to carve one off (roughly one thread per three).
    hash_sender: Option<Sender<DiskJob>>,
    hash_threads: usize,
    handles: Vec<JoinHandle<()>>,
}

impl DiskWorkerPool {
    pub fn spawn<L>(thread_count: usize, lookup: L) -> Self
    where
        L: StorageLookup + Clone + 'static,
    {
        let thread_count = thread_count.max(1);
        let hash_threads = thread_count / 3;
        let general_threads = thread_count - hash_threads;

        let (sender, receiver): (Sender<DiskJob>, Receiver<DiskJob>) = bounded(1024);
        let mut handles = Vec::with_capacity(thread_count);
        for _ in 0..general_threads {
            let receiver = receiver.clone();
            let lookup = lookup.clone();
            handles.push(std::thread::spawn(move || worker_loop(receiver, lookup)));
        }

        let hash_sender = if hash_threads > 0 {
            let (hash_sender, hash_receiver): (Sender<DiskJob>, Receiver<DiskJob>) = bounded(1024);
            for _ in 0..hash_threads {
                let hash_receiver = hash_receiver.clone();
                let lookup = lookup.clone();
                handles.push(std::thread::spawn(move || worker_loop(hash_receiver, lookup)));
            }
            Some(hash_sender)
        } else {
            None
        };

        DiskWorkerPool { sender, general_threads, hash_sender, hash_threads, handles }
    }

    pub fn submit(&self, job: DiskJob) {
        // The pool outlives every torrent that submits to it; a full
        // queue backs up the network thread deliberately rather than
        // dropping work silently.
        match (&job, &self.hash_sender) {
            (DiskJob::HashPiece { .. }, Some(hash_sender)) => {
                let _ = hash_sender.send(job);
            }
            _ => {
                let _ = self.sender.send(job);
            }
        }
    }

    pub fn shutdown(self) {
        for _ in 0..self.general_threads {
            let _ = self.sender.send(DiskJob::Shutdown);
        }
        if let Some(hash_sender) = &self.hash_sender {
            for _ in 0..self.hash_threads {
                let _ = hash_sender.send(DiskJob::Shutdown);
            }
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop<L: StorageLookup>(receiver: Receiver<DiskJob>, lookup: L) {
    while let Ok(job) = receiver.recv() {
        match job {
            DiskJob::Read { torrent, piece, offset, len, reply } => {
                let result = lookup
                    .with_storage(torrent, |storage| {
                        let mut buf = vec![0u8; len as usize];
                        storage.readv(piece, offset, &mut buf).map(|_| buf)
                    })
                    .unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::Write { torrent, piece, offset, data, reply } => {
                let result = lookup
                    .with_storage(torrent, |storage| storage.writev(piece, offset, &data))
                    .unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::HashPiece { data, reply, .. } => {
                let _ = reply.send(crate::hashing::sha1_of(&data));
            }
            DiskJob::ClearPiece { torrent, piece, reply } => {
                let result = lookup.with_storage(torrent, |storage| storage.clear_piece(piece)).unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::FlushPiece { torrent, piece, reply } => {
                let result = lookup.with_storage(torrent, |storage| storage.flush_piece(piece)).unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::FlushStorage { torrent, reply } => {
                let result = lookup.with_storage(torrent, |storage| storage.flush_storage()).unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::ReleaseFiles { torrent, reply } => {
                let result = lookup.with_storage(torrent, |storage| storage.release_files()).unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::DeleteFiles { torrent, reply } => {
                let result = lookup.with_storage(torrent, |storage| storage.delete_files()).unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::MoveStorage { torrent, new_path, reply } => {
                let result = lookup
                    .with_storage(torrent, |storage| storage.move_storage(&new_path))
                    .unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::RenameFile { torrent, file_index, new_name, reply } => {
                let result = lookup
                    .with_storage(torrent, |storage| storage.rename_file(file_index, &new_name))
                    .unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::SetFilePriority { torrent, file_index, priority, reply } => {
                lookup.with_storage(torrent, |storage| storage.set_file_priority(file_index, priority));
                let _ = reply.send(());
            }
            DiskJob::CheckFiles { torrent, piece_hashes, piece_length, reply } => {
                let result = lookup
                    .with_storage(torrent, |storage| storage.check_files(&piece_hashes, piece_length))
                    .unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::StopTorrent { torrent, reply } => {
                let result = lookup.with_storage(torrent, |storage| storage.stop_torrent()).unwrap_or_else(|| Err(not_found()));
                let _ = reply.send(result);
            }
            DiskJob::Shutdown => break,
        }
    }
}
