//! The storage backend interface consumed by the disk task, and a plain
//! file-backed implementation of it.
//!
//! The disk task never touches files directly: every read, write, and
//! destructive operation goes through the [`Storage`] trait. The bundled
//! [`FileStorage`] maps the torrent's byte stream onto flat files under a
//! download directory using positioned vectored IO. Anything fancier (custom
//! layouts, object stores, encrypted blobs) can be plugged in by implementing
//! the trait.

use {
    bytes::Bytes,
    nix::sys::uio::{preadv, pwritev, IoVec},
    std::{
        fs::{self, File, OpenOptions},
        os::unix::io::AsRawFd,
        path::{Path, PathBuf},
        sync::Mutex,
        time::UNIX_EPOCH,
    },
};

use crate::{
    error::StorageError,
    storage_info::{FileInfo, StorageInfo},
    Bitfield, FileIndex, PieceIndex,
};

/// How file space is claimed for a torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationMode {
    /// Files are created sparse and grow as pieces arrive.
    Sparse,
    /// Files are fully allocated up front.
    Allocate,
    /// Legacy compact allocation; opaque to this crate.
    Compact,
}

/// The snapshot of on disk state a torrent needs to resume without a full
/// recheck.
///
/// This crate does not define a wire encoding for it; the struct derives
/// serde traits so the embedding engine can encode it however it persists
/// its session state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeData {
    /// Per file sizes and modification times, in torrent file order.
    pub files: Vec<ResumeFileEntry>,
    /// Which pieces are present on disk. The engine overlays its own piece
    /// state here before persisting; storage fills in what it can observe.
    pub pieces: Bitfield,
    /// How file space is claimed.
    pub allocation: AllocationMode,
    /// Renames applied to files after the torrent was added, if any, keyed
    /// by file index.
    pub renamed_files: Vec<(FileIndex, String)>,
    /// Optional per file priorities, in torrent file order.
    pub file_priorities: Option<Vec<u8>>,
}

/// A single file's identity in resume data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeFileEntry {
    /// The file's size in bytes at save time.
    pub len: u64,
    /// Seconds since the epoch of the file's last modification, 0 when
    /// unknown.
    pub mtime: u64,
}

/// The status of a file as seen by the storage layer.
#[derive(Clone, Debug)]
pub struct FileStatus {
    pub path: PathBuf,
    pub is_open: bool,
}

/// The interface between the disk task and a torrent's persistent storage.
///
/// The transfer methods (`readv`/`writev`) are invoked on blocking IO
/// workers, potentially several at a time, which is why the trait requires
/// `Send + Sync` and all methods take `&self`. Implementations guard their
/// mutable state internally.
pub trait Storage: Send + Sync {
    /// Prepares the storage for IO: creates directories, optionally
    /// preallocates file space.
    fn initialize(&self, allocate_files: bool) -> Result<(), StorageError>;

    /// Reads into the given buffers from the piece, starting at the byte
    /// offset within the piece. Buffers are filled in order. Returns the
    /// number of bytes read, which is less than the requested total only at
    /// end of file.
    fn readv(
        &self,
        bufs: &mut [Vec<u8>],
        piece: PieceIndex,
        offset: u32,
    ) -> Result<usize, StorageError>;

    /// Writes the given buffers to the piece, starting at the byte offset
    /// within the piece. Returns the number of bytes written.
    fn writev(
        &self,
        bufs: &[Bytes],
        piece: PieceIndex,
        offset: u32,
    ) -> Result<usize, StorageError>;

    /// Post-read hook, called with the filled buffers before completions are
    /// delivered. Checksumming middlewares hook in here.
    fn readv_done(&self, _bufs: &[Vec<u8>], _piece: PieceIndex, _offset: u32) {}

    /// Returns true if any of the torrent's files exist on disk.
    fn has_any_file(&self) -> Result<bool, StorageError>;

    /// Moves all files to a new download directory.
    fn move_storage(&self, new_dir: &Path) -> Result<(), StorageError>;

    /// Renames one file.
    fn rename_file(
        &self,
        index: FileIndex,
        new_name: &str,
    ) -> Result<(), StorageError>;

    /// Closes all open file handles. IO after this reopens them on demand.
    fn release_files(&self) -> Result<(), StorageError>;

    /// Deletes all files belonging to the torrent.
    fn delete_files(&self) -> Result<(), StorageError>;

    /// Called when the last piece overlapping the file has been written.
    fn finalize_file(&self, _index: FileIndex) -> Result<(), StorageError> {
        Ok(())
    }

    /// Checks saved resume data against the on disk state. Returns false if
    /// a full recheck is needed.
    fn verify_resume_data(
        &self,
        data: &ResumeData,
    ) -> Result<bool, StorageError>;

    /// Captures the current on disk state as resume data.
    fn write_resume_data(&self) -> Result<ResumeData, StorageError>;

    /// The position of the given piece byte on the physical disk, used as
    /// the one-dimensional head position for elevator sorting. The default
    /// assumes the torrent is laid out contiguously.
    fn physical_offset(&self, piece: PieceIndex, offset: u32) -> u64;

    /// Advises the OS that the given range will soon be read.
    fn hint_read(&self, _piece: PieceIndex, _offset: u32, _len: u32) {}

    /// Returns the first piece at or after `piece` that is not inside a
    /// sparse hole. The default claims nothing is sparse.
    fn sparse_end(&self, piece: PieceIndex) -> PieceIndex {
        piece
    }

    /// The open-file status of the torrent's files.
    fn file_status(&self) -> Vec<FileStatus> {
        Vec::new()
    }
}

/// A file in a [`FileStorage`], opened lazily.
struct StorageFile {
    info: FileInfo,
    handle: Option<File>,
}

impl StorageFile {
    /// Opens the file handle if it isn't already open, creating the file and
    /// any parent directories on first touch.
    fn ensure_open(&mut self, dir: &Path) -> Result<&File, StorageError> {
        if self.handle.is_none() {
            let path = dir.join(&self.info.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    log::info!("Creating torrent subdir {:?}", subdir);
                    fs::create_dir_all(&subdir).map_err(|e| {
                        StorageError::with_path(subdir.to_path_buf(), e)
                    })?;
                }
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", path);
                    StorageError::with_path(path.clone(), e)
                })?;
            self.handle = Some(handle);
        }
        // the handle was just ensured above
        Ok(self.handle.as_ref().unwrap())
    }
}

/// Storage backed by plain files under a download directory, one per torrent
/// file, laid out contiguously.
pub struct FileStorage {
    info: StorageInfo,
    allocation: AllocationMode,
    state: Mutex<FileStorageState>,
}

struct FileStorageState {
    download_dir: PathBuf,
    files: Vec<StorageFile>,
    renamed_files: Vec<(FileIndex, String)>,
}

impl FileStorage {
    pub fn new(info: StorageInfo, allocation: AllocationMode) -> Self {
        let files = info
            .structure
            .files()
            .iter()
            .map(|info| StorageFile {
                info: info.clone(),
                handle: None,
            })
            .collect();
        let download_dir = info.download_dir.clone();
        Self {
            info,
            allocation,
            state: Mutex::new(FileStorageState {
                download_dir,
                files,
                renamed_files: Vec::new(),
            }),
        }
    }

    /// Runs `op` against the file containing the given torrent offset,
    /// handing it the open handle, the in-file range, and how many of the
    /// requested bytes fall inside this file.
    fn with_file_at<T>(
        &self,
        torrent_offset: u64,
        len: u64,
        op: impl FnOnce(&File, u64, u64) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut state = self.state.lock().unwrap();
        let file_range = self
            .info
            .structure
            .files_intersecting_bytes(torrent_offset..torrent_offset + len);
        debug_assert!(!file_range.is_empty());
        let index = file_range.start;
        let dir = state.download_dir.clone();
        let file = &mut state.files[index];
        let slice = file.info.get_slice(torrent_offset, len);
        let handle = file.ensure_open(&dir)?;
        op(handle, slice.offset, slice.len)
    }
}

impl Storage for FileStorage {
    fn initialize(&self, allocate_files: bool) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let dir = state.download_dir.clone();
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .map_err(|e| StorageError::with_path(dir.clone(), e))?;
        }
        if allocate_files || self.allocation == AllocationMode::Allocate {
            for file in state.files.iter_mut() {
                let len = file.info.len;
                let handle = file.ensure_open(&dir)?;
                handle.set_len(len).map_err(StorageError::new)?;
            }
        }
        Ok(())
    }

    fn readv(
        &self,
        bufs: &mut [Vec<u8>],
        piece: PieceIndex,
        offset: u32,
    ) -> Result<usize, StorageError> {
        let total_len: usize = bufs.iter().map(|b| b.len()).sum();
        let mut torrent_offset =
            self.info.piece_torrent_offset(piece) + offset as u64;
        let mut transferred = 0;

        while transferred < total_len {
            let want = (total_len - transferred) as u64;
            let (span, eof) =
                self.with_file_at(torrent_offset, want, |file, off, len| {
                    let mut done = 0usize;
                    while (done as u64) < len {
                        let iovecs = read_iovecs(
                            bufs,
                            transferred + done,
                            len as usize - done,
                        );
                        let count = preadv(
                            file.as_raw_fd(),
                            &iovecs,
                            (off + done as u64) as i64,
                        )?;
                        if count == 0 {
                            // the file is shorter than the requested range;
                            // report what we got and let the caller decide
                            return Ok((done, true));
                        }
                        done += count;
                    }
                    Ok((done, false))
                })?;
            transferred += span;
            torrent_offset += span as u64;
            if eof {
                break;
            }
        }
        Ok(transferred)
    }

    fn writev(
        &self,
        bufs: &[Bytes],
        piece: PieceIndex,
        offset: u32,
    ) -> Result<usize, StorageError> {
        let total_len: usize = bufs.iter().map(|b| b.len()).sum();
        let mut torrent_offset =
            self.info.piece_torrent_offset(piece) + offset as u64;
        let mut transferred = 0;

        while transferred < total_len {
            let want = (total_len - transferred) as u64;
            let span =
                self.with_file_at(torrent_offset, want, |file, off, len| {
                    // IO syscalls are not guaranteed to transfer the whole
                    // input in one go, so keep writing until the span is on
                    // disk or an error occurs
                    let mut done = 0usize;
                    while (done as u64) < len {
                        let iovecs = write_iovecs(
                            bufs,
                            transferred + done,
                            len as usize - done,
                        );
                        let count = pwritev(
                            file.as_raw_fd(),
                            &iovecs,
                            (off + done as u64) as i64,
                        )?;
                        done += count;
                    }
                    Ok(done)
                })?;
            transferred += span;
            torrent_offset += span as u64;
        }
        Ok(transferred)
    }

    fn has_any_file(&self) -> Result<bool, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .iter()
            .any(|f| state.download_dir.join(&f.info.path).exists()))
    }

    fn move_storage(&self, new_dir: &Path) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        fs::create_dir_all(new_dir)
            .map_err(|e| StorageError::with_path(new_dir.to_path_buf(), e))?;
        let download_dir = state.download_dir.clone();
        for file in state.files.iter_mut() {
            // close the handle before moving the file under it
            file.handle = None;
            let old_path = download_dir.join(&file.info.path);
            if !old_path.exists() {
                continue;
            }
            let new_path = new_dir.join(&file.info.path);
            if let Some(subdir) = new_path.parent() {
                fs::create_dir_all(subdir).map_err(|e| {
                    StorageError::with_path(subdir.to_path_buf(), e)
                })?;
            }
            fs::rename(&old_path, &new_path)
                .map_err(|e| StorageError::with_path(old_path, e))?;
        }
        state.download_dir = new_dir.to_path_buf();
        Ok(())
    }

    fn rename_file(
        &self,
        index: FileIndex,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if index >= state.files.len() {
            return Err(StorageError::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "file index out of range",
            )));
        }
        let dir = state.download_dir.clone();
        let file = &mut state.files[index];
        file.handle = None;
        let old_path = dir.join(&file.info.path);
        let new_rel = file
            .info
            .path
            .parent()
            .map(|p| p.join(new_name))
            .unwrap_or_else(|| PathBuf::from(new_name));
        let new_path = dir.join(&new_rel);
        if old_path.exists() {
            fs::rename(&old_path, &new_path)
                .map_err(|e| StorageError::with_path(old_path, e))?;
        }
        file.info.path = new_rel;
        state.renamed_files.push((index, new_name.to_string()));
        Ok(())
    }

    fn release_files(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        for file in state.files.iter_mut() {
            file.handle = None;
        }
        Ok(())
    }

    fn delete_files(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let dir = state.download_dir.clone();
        for file in state.files.iter_mut() {
            file.handle = None;
            let path = dir.join(&file.info.path);
            if path.exists() {
                fs::remove_file(&path)
                    .map_err(|e| StorageError::with_path(path, e))?;
            }
        }
        Ok(())
    }

    fn verify_resume_data(
        &self,
        data: &ResumeData,
    ) -> Result<bool, StorageError> {
        let state = self.state.lock().unwrap();
        if data.files.len() != state.files.len() {
            return Ok(false);
        }
        for (entry, file) in data.files.iter().zip(state.files.iter()) {
            let path = state.download_dir.join(&file.info.path);
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                // a missing file is fine as long as resume data agrees it
                // had no bytes
                Err(_) => {
                    if entry.len > 0 {
                        return Ok(false);
                    }
                    continue;
                }
            };
            if meta.len() != entry.len {
                return Ok(false);
            }
            if entry.mtime > 0 && file_mtime(&meta) > entry.mtime {
                // modified since the resume data was saved
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn write_resume_data(&self) -> Result<ResumeData, StorageError> {
        let state = self.state.lock().unwrap();
        let mut files = Vec::with_capacity(state.files.len());
        for file in state.files.iter() {
            let path = state.download_dir.join(&file.info.path);
            let entry = match fs::metadata(&path) {
                Ok(meta) => ResumeFileEntry {
                    len: meta.len(),
                    mtime: file_mtime(&meta),
                },
                Err(_) => ResumeFileEntry { len: 0, mtime: 0 },
            };
            files.push(entry);
        }
        Ok(ResumeData {
            files,
            pieces: Bitfield::repeat(false, self.info.piece_count),
            allocation: self.allocation,
            renamed_files: state.renamed_files.clone(),
            file_priorities: None,
        })
    }

    fn physical_offset(&self, piece: PieceIndex, offset: u32) -> u64 {
        self.info.piece_torrent_offset(piece) + offset as u64
    }

    fn sparse_end(&self, piece: PieceIndex) -> PieceIndex {
        // flat files are created on demand; pieces whose files don't exist
        // yet are all hole
        piece
    }

    fn file_status(&self) -> Vec<FileStatus> {
        let state = self.state.lock().unwrap();
        state
            .files
            .iter()
            .map(|f| FileStatus {
                path: state.download_dir.join(&f.info.path),
                is_open: f.handle.is_some(),
            })
            .collect()
    }
}

/// Seconds-since-epoch mtime of a file, 0 when unavailable.
fn file_mtime(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builds read iovecs over `bufs`, skipping the first `skip` bytes and
/// bounding the total to `max` bytes.
fn read_iovecs<'a>(
    bufs: &'a mut [Vec<u8>],
    mut skip: usize,
    mut max: usize,
) -> Vec<IoVec<&'a mut [u8]>> {
    let mut iovecs = Vec::new();
    for buf in bufs.iter_mut() {
        if max == 0 {
            break;
        }
        let len = buf.len();
        if skip >= len {
            skip -= len;
            continue;
        }
        let end = len.min(skip + max);
        let slice = &mut buf[skip..end];
        max -= slice.len();
        skip = 0;
        iovecs.push(IoVec::from_mut_slice(slice));
    }
    iovecs
}

/// Builds write iovecs over `bufs`, skipping the first `skip` bytes and
/// bounding the total to `max` bytes.
fn write_iovecs<'a>(
    bufs: &'a [Bytes],
    mut skip: usize,
    mut max: usize,
) -> Vec<IoVec<&'a [u8]>> {
    let mut iovecs = Vec::new();
    for buf in bufs.iter() {
        if max == 0 {
            break;
        }
        let len = buf.len();
        if skip >= len {
            skip -= len;
            continue;
        }
        let end = len.min(skip + max);
        let slice = &buf[skip..end];
        max -= slice.len();
        skip = 0;
        iovecs.push(IoVec::from_slice(slice));
    }
    iovecs
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// A storage that swallows writes and reads back zeroes. Handy for
    /// exercising scheduler plumbing without touching the file system.
    #[derive(Default)]
    pub(crate) struct NullStorage;

    impl Storage for NullStorage {
        fn initialize(&self, _allocate_files: bool) -> Result<(), StorageError> {
            Ok(())
        }

        fn readv(
            &self,
            bufs: &mut [Vec<u8>],
            _piece: PieceIndex,
            _offset: u32,
        ) -> Result<usize, StorageError> {
            Ok(bufs.iter().map(|b| b.len()).sum())
        }

        fn writev(
            &self,
            bufs: &[Bytes],
            _piece: PieceIndex,
            _offset: u32,
        ) -> Result<usize, StorageError> {
            Ok(bufs.iter().map(|b| b.len()).sum())
        }

        fn has_any_file(&self) -> Result<bool, StorageError> {
            Ok(false)
        }

        fn move_storage(&self, _new_dir: &Path) -> Result<(), StorageError> {
            Ok(())
        }

        fn rename_file(
            &self,
            _index: FileIndex,
            _new_name: &str,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        fn release_files(&self) -> Result<(), StorageError> {
            Ok(())
        }

        fn delete_files(&self) -> Result<(), StorageError> {
            Ok(())
        }

        fn verify_resume_data(
            &self,
            _data: &ResumeData,
        ) -> Result<bool, StorageError> {
            Ok(false)
        }

        fn write_resume_data(&self) -> Result<ResumeData, StorageError> {
            Ok(ResumeData {
                files: Vec::new(),
                pieces: Bitfield::new(),
                allocation: AllocationMode::Sparse,
                renamed_files: Vec::new(),
                file_priorities: None,
            })
        }

        fn physical_offset(&self, piece: PieceIndex, offset: u32) -> u64 {
            piece as u64 * crate::BLOCK_LEN as u64 + offset as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FsStructure;

    fn test_info(dir: &Path) -> StorageInfo {
        // two pieces of 32 bytes across three files
        StorageInfo::new(
            2,
            32,
            dir,
            FsStructure::Archive {
                files: vec![
                    FileInfo {
                        path: PathBuf::from("a"),
                        torrent_offset: 0,
                        len: 10,
                    },
                    FileInfo {
                        path: PathBuf::from("sub/b"),
                        torrent_offset: 10,
                        len: 30,
                    },
                    FileInfo {
                        path: PathBuf::from("c"),
                        torrent_offset: 40,
                        len: 24,
                    },
                ],
            },
        )
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("torrent-disk-storage-tests").join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }
        dir
    }

    #[test]
    fn test_write_read_roundtrip_across_files() {
        use rand::Rng;

        let dir = test_dir("roundtrip");
        let storage = FileStorage::new(test_info(&dir), AllocationMode::Sparse);
        storage.initialize(false).unwrap();

        // write both pieces, spanning all three files
        let mut rng = rand::thread_rng();
        let piece0: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let piece1: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let n = storage
            .writev(&[Bytes::from(piece0.clone())], 0, 0)
            .unwrap();
        assert_eq!(n, 32);
        let n = storage
            .writev(&[Bytes::from(piece1.clone())], 1, 0)
            .unwrap();
        assert_eq!(n, 32);

        // read piece 0 back in two buffers
        let mut bufs = vec![vec![0; 16], vec![0; 16]];
        let n = storage.readv(&mut bufs, 0, 0).unwrap();
        assert_eq!(n, 32);
        assert_eq!(&bufs[0], &piece0[..16]);
        assert_eq!(&bufs[1], &piece0[16..]);

        // read an unaligned range of piece 1
        let mut bufs = vec![vec![0; 10]];
        let n = storage.readv(&mut bufs, 1, 5).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&bufs[0], &piece1[5..15]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_short_read_reports_transferred() {
        let dir = test_dir("short-read");
        let storage = FileStorage::new(test_info(&dir), AllocationMode::Sparse);
        storage.initialize(false).unwrap();

        // only write half of piece 0; reading the whole piece comes up short
        let n = storage
            .writev(&[Bytes::from(vec![0xAB; 16])], 0, 0)
            .unwrap();
        assert_eq!(n, 16);

        let mut bufs = vec![vec![0; 32]];
        let n = storage.readv(&mut bufs, 0, 0).unwrap();
        assert_eq!(n, 16);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_delete_and_has_any_file() {
        let dir = test_dir("delete");
        let storage = FileStorage::new(test_info(&dir), AllocationMode::Sparse);
        storage.initialize(false).unwrap();
        assert!(!storage.has_any_file().unwrap());

        storage
            .writev(&[Bytes::from(vec![1u8; 8])], 0, 0)
            .unwrap();
        assert!(storage.has_any_file().unwrap());

        storage.delete_files().unwrap();
        assert!(!storage.has_any_file().unwrap());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_resume_data_roundtrip() {
        let dir = test_dir("resume");
        let storage = FileStorage::new(test_info(&dir), AllocationMode::Sparse);
        storage.initialize(false).unwrap();
        storage
            .writev(&[Bytes::from((0..32u8).collect::<Vec<_>>())], 0, 0)
            .unwrap();

        let resume = storage.write_resume_data().unwrap();
        assert_eq!(resume.files.len(), 3);
        assert!(storage.verify_resume_data(&resume).unwrap());

        // growing a file invalidates the resume data
        storage
            .writev(&[Bytes::from((32..64u8).collect::<Vec<_>>())], 1, 0)
            .unwrap();
        assert!(!storage.verify_resume_data(&resume).unwrap());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rename_file() {
        let dir = test_dir("rename");
        let storage = FileStorage::new(test_info(&dir), AllocationMode::Sparse);
        storage.initialize(false).unwrap();
        storage
            .writev(&[Bytes::from(vec![7u8; 10])], 0, 0)
            .unwrap();

        storage.rename_file(0, "renamed").unwrap();
        assert!(dir.join("renamed").exists());
        assert!(!dir.join("a").exists());

        // IO keeps working against the new name
        let mut bufs = vec![vec![0; 10]];
        let n = storage.readv(&mut bufs, 0, 0).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&bufs[0], &[7u8; 10]);

        fs::remove_dir_all(&dir).unwrap();
    }
}
