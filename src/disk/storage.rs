//! Storage backend contract and the default filesystem implementation.
//! Pieces span file boundaries in multi-file torrents, so every read/write
//! is expressed as a piece-relative byte range that `FilesystemStorage`
//! maps onto the underlying files; other backends (in-memory for tests,
//! a future mmap-backed one) implement the same `Storage` trait.

use crate::error::StorageError;
use crate::metainfo::{FileEntry, MetaInfo};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilePriority {
    DoNotDownload,
    Low,
    Normal,
    High,
}

impl Default for FilePriority {
    fn default() -> Self {
        FilePriority::Normal
    }
}

/// Backend contract a torrent's disk I/O is dispatched through. Piece
/// indices and byte offsets are piece-relative; the implementation maps
/// them onto actual files using the torrent's file layout.
pub trait Storage: Send {
    fn readv(&mut self, piece: u32, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;
    fn writev(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<(), StorageError>;
    fn move_storage(&mut self, new_path: &Path) -> Result<(), StorageError>;
    fn rename_file(&mut self, file_index: usize, new_name: &str) -> Result<(), StorageError>;
    fn release_files(&mut self) -> Result<(), StorageError>;
    fn delete_files(&mut self) -> Result<(), StorageError>;
    fn has_any_file(&self) -> bool;
    fn set_file_priority(&mut self, file_index: usize, priority: FilePriority);
    /// Reads every file on disk and returns a piece-indexed bitmap of
    /// which pieces already match their expected hash, used to resume a
    /// torrent without re-downloading data it already has.
    fn verify_resume_data(&mut self, piece_hashes: &[[u8; 20]], piece_length: i64) -> Result<Vec<bool>, StorageError>;

    /// Evicts any in-memory dirty state held for `piece`, unconditionally,
    /// so it is re-fetched from scratch after a hash-failure. A no-op for
    /// backends that write straight through with no buffering of their own.
    fn clear_piece(&mut self, _piece: u32) -> Result<(), StorageError> {
        Ok(())
    }

    /// Forces any buffered bytes for `piece` out to disk.
    fn flush_piece(&mut self, _piece: u32) -> Result<(), StorageError> {
        Ok(())
    }

    /// Forces every buffered write for the torrent out to disk.
    fn flush_storage(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Checks on-disk data against the expected piece hashes, used to
    /// resume a torrent without redownloading data it already has.
    /// Defaults to `verify_resume_data`.
    fn check_files(&mut self, piece_hashes: &[[u8; 20]], piece_length: i64) -> Result<Vec<bool>, StorageError> {
        self.verify_resume_data(piece_hashes, piece_length)
    }

    /// Releases whatever a stopped torrent no longer needs held open.
    /// Defaults to `release_files`.
    fn stop_torrent(&mut self) -> Result<(), StorageError> {
        self.release_files()
    }
}

struct OpenFile {
    handle: File,
    path: PathBuf,
    length: i64,
    priority: FilePriority,
}

/// Maps a torrent's logical byte range onto real files under `save_path`,
/// creating sparse files sized to their final length up front.
pub struct FilesystemStorage {
    save_path: PathBuf,
    files: Vec<OpenFile>,
    /// Cumulative byte offset where each file begins in the flattened
    /// torrent byte space.
    file_offsets: Vec<i64>,
    piece_length: i64,
}

impl FilesystemStorage {
    pub fn create(meta: &MetaInfo, save_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let save_path = save_path.into();
        fs::create_dir_all(&save_path).map_err(|e| io_err(e, &save_path))?;

        let mut files = Vec::new();
        let mut file_offsets = Vec::new();
        let mut cursor = 0i64;
        for entry in meta.files() {
            let path = file_path(&save_path, &entry);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(e, parent))?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| io_err(e, &path))?;
            handle.set_len(entry.length.max(0) as u64).map_err(|e| io_err(e, &path))?;
            file_offsets.push(cursor);
            cursor += entry.length;
            files.push(OpenFile { handle, path, length: entry.length, priority: FilePriority::default() });
        }

        Ok(FilesystemStorage { save_path, files, file_offsets, piece_length: meta.piece_length() })
    }

    fn absolute_offset(&self, piece: u32, offset: u32) -> i64 {
        piece as i64 * self.piece_length + offset as i64
    }

    /// Splits a `(absolute_offset, len)` byte range across the files it
    /// spans, yielding `(file_index, offset_within_file, len_in_file)`.
    fn spans(&self, absolute_offset: i64, len: usize) -> Vec<(usize, u64, usize)> {
        let mut spans = Vec::new();
        let mut remaining = len;
        let mut cursor = absolute_offset;
        for (idx, file) in self.files.iter().enumerate() {
            let file_start = self.file_offsets[idx];
            let file_end = file_start + file.length;
            if cursor >= file_end || remaining == 0 {
                continue;
            }
            if cursor + remaining as i64 <= file_start {
                break;
            }
            if cursor < file_start {
                continue;
            }
            let within = (cursor - file_start) as u64;
            let available = (file_end - cursor).max(0) as usize;
            let take = remaining.min(available);
            if take > 0 {
                spans.push((idx, within, take));
                cursor += take as i64;
                remaining -= take;
            }
        }
        spans
    }
}

impl Storage for FilesystemStorage {
    fn readv(&mut self, piece: u32, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let absolute = self.absolute_offset(piece, offset);
        let mut written = 0usize;
        for (idx, within, take) in self.spans(absolute, buf.len()) {
            let file = &mut self.files[idx];
            file.handle.seek(SeekFrom::Start(within)).map_err(|e| io_err(e, &file.path))?;
            file.handle
                .read_exact(&mut buf[written..written + take])
                .map_err(|e| io_err(e, &file.path))?;
            written += take;
        }
        Ok(())
    }

    fn writev(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let absolute = self.absolute_offset(piece, offset);
        let mut read = 0usize;
        for (idx, within, take) in self.spans(absolute, data.len()) {
            let file = &mut self.files[idx];
            file.handle.seek(SeekFrom::Start(within)).map_err(|e| io_err(e, &file.path))?;
            file.handle
                .write_all(&data[read..read + take])
                .map_err(|e| io_err(e, &file.path))?;
            read += take;
        }
        Ok(())
    }

    fn move_storage(&mut self, new_path: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(new_path).map_err(|e| io_err(e, new_path))?;
        for file in &mut self.files {
            let rel = file.path.strip_prefix(&self.save_path).unwrap_or(&file.path);
            let dest = new_path.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(e, parent))?;
            }
            fs::rename(&file.path, &dest).map_err(|e| io_err(e, &dest))?;
            file.path = dest;
        }
        self.save_path = new_path.to_path_buf();
        Ok(())
    }

    fn rename_file(&mut self, file_index: usize, new_name: &str) -> Result<(), StorageError> {
        let file = self
            .files
            .get_mut(file_index)
            .ok_or_else(|| StorageError { path_hint: None, source: std::io::Error::new(std::io::ErrorKind::NotFound, "file index out of range") })?;
        let dest = file.path.with_file_name(new_name);
        fs::rename(&file.path, &dest).map_err(|e| io_err(e, &dest))?;
        file.path = dest;
        Ok(())
    }

    fn release_files(&mut self) -> Result<(), StorageError> {
        // File handles close on drop; nothing else to flush eagerly since
        // writes are not buffered beyond the OS page cache.
        Ok(())
    }

    fn delete_files(&mut self) -> Result<(), StorageError> {
        for file in &self.files {
            if file.path.exists() {
                fs::remove_file(&file.path).map_err(|e| io_err(e, &file.path))?;
            }
        }
        Ok(())
    }

    fn has_any_file(&self) -> bool {
        self.files.iter().any(|f| f.path.exists())
    }

    fn set_file_priority(&mut self, file_index: usize, priority: FilePriority) {
        if let Some(file) = self.files.get_mut(file_index) {
            file.priority = priority;
        }
    }

    fn verify_resume_data(&mut self, piece_hashes: &[[u8; 20]], piece_length: i64) -> Result<Vec<bool>, StorageError> {
        let mut result = vec![false; piece_hashes.len()];
        let mut buf = vec![0u8; piece_length as usize];
        for (i, expected) in piece_hashes.iter().enumerate() {
            let absolute = i as i64 * piece_length;
            let spans = self.spans(absolute, piece_length as usize);
            if spans.is_empty() {
                continue;
            }
            let mut ok = true;
            let mut written = 0usize;
            for (idx, within, take) in spans {
                let file = &mut self.files[idx];
                if file.handle.seek(SeekFrom::Start(within)).is_err()
                    || file.handle.read_exact(&mut buf[written..written + take]).is_err()
                {
                    ok = false;
                    break;
                }
                written += take;
            }
            if ok {
                let hash = crate::hashing::sha1_of(&buf[..written]);
                result[i] = &hash == expected;
            }
        }
        Ok(result)
    }
}

fn file_path(save_path: &Path, entry: &FileEntry) -> PathBuf {
    let mut path = save_path.to_path_buf();
    for component in &entry.path {
        path.push(component);
    }
    path
}

fn io_err(source: std::io::Error, path: &Path) -> StorageError {
    StorageError { path_hint: Some(path.display().to_string()), source }
}

/// An in-memory `Storage` for unit tests that don't want real files.
pub struct MemoryStorage {
    pub pieces: HashMap<u32, Vec<u8>>,
    piece_length: usize,
}

impl MemoryStorage {
    pub fn new(piece_length: usize) -> Self {
        MemoryStorage { pieces: HashMap::new(), piece_length }
    }
}

impl Storage for MemoryStorage {
    fn readv(&mut self, piece: u32, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let data = self.pieces.entry(piece).or_insert_with(|| vec![0u8; self.piece_length]);
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn writev(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let entry = self.pieces.entry(piece).or_insert_with(|| vec![0u8; self.piece_length]);
        let start = offset as usize;
        entry[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn move_storage(&mut self, _new_path: &Path) -> Result<(), StorageError> {
        Ok(())
    }

    fn rename_file(&mut self, _file_index: usize, _new_name: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn release_files(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn delete_files(&mut self) -> Result<(), StorageError> {
        self.pieces.clear();
        Ok(())
    }

    fn has_any_file(&self) -> bool {
        !self.pieces.is_empty()
    }

    fn set_file_priority(&mut self, _file_index: usize, _priority: FilePriority) {}

    fn verify_resume_data(&mut self, piece_hashes: &[[u8; 20]], _piece_length: i64) -> Result<Vec<bool>, StorageError> {
        Ok(piece_hashes
            .iter()
            .enumerate()
            .map(|(i, expected)| {
                self.pieces
                    .get(&(i as u32))
                    .map(|data| &crate::hashing::sha1_of(data) == expected)
                    .unwrap_or(false)
            })
            .collect())
    }

    fn clear_piece(&mut self, piece: u32) -> Result<(), StorageError> {
        self.pieces.remove(&piece);
        Ok(())
    }
}
