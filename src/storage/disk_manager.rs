use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{ChalkDBError, ChalkDBResult};

static EMPTY_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Fixed-size page I/O over a single database file.
///
/// Page `n` lives at byte offset `n * PAGE_SIZE`. Page 0 is reserved for
/// the header page and is never handed out by `allocate_page`. Allocation
/// is monotonic; `deallocate_page` zeroes the page on disk but does not
/// recycle the id.
#[derive(Debug)]
pub struct DiskManager {
    // One thread at a time may touch the file handle; seek + read/write
    // must be a single critical section.
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> ChalkDBResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_path.as_ref())?;

        let db_file_len = db_file.metadata()?.len();
        if db_file_len % PAGE_SIZE as u64 != 0 {
            return Err(ChalkDBError::Storage(format!(
                "db file size {} is not a multiple of page size {}",
                db_file_len, PAGE_SIZE
            )));
        }
        // Page 0 is the header page, so fresh files still start allocating
        // at page 1.
        let next_page_id = (db_file_len / PAGE_SIZE as u64).max(1) as PageId;
        debug!("disk manager opened, next_page_id = {}", next_page_id);

        Ok(Self {
            db_file: Mutex::new(db_file),
            next_page_id: AtomicU32::new(next_page_id),
        })
    }

    pub fn read_page(&self, page_id: PageId) -> ChalkDBResult<[u8; PAGE_SIZE]> {
        if page_id == INVALID_PAGE_ID {
            return Err(ChalkDBError::Storage(
                "read_page: invalid page id".to_string(),
            ));
        }
        let mut guard = self.db_file.lock();
        let mut page = [0u8; PAGE_SIZE];
        guard.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        // A page that was allocated but never written reads back as zeros.
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = guard.read(&mut page[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(page)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> ChalkDBResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(ChalkDBError::Storage(
                "write_page: invalid page id".to_string(),
            ));
        }
        if data.len() != PAGE_SIZE {
            return Err(ChalkDBError::Internal(format!(
                "write_page: expected {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        let mut guard = self.db_file.lock();
        guard.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        guard.write_all(data)?;
        guard.flush()?;
        Ok(())
    }

    pub fn allocate_page(&self) -> ChalkDBResult<PageId> {
        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        Ok(page_id)
    }

    pub fn deallocate_page(&self, page_id: PageId) -> ChalkDBResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(ChalkDBError::Storage(
                "deallocate_page: invalid page id".to_string(),
            ));
        }
        self.write_page(page_id, &EMPTY_PAGE)
    }

    pub fn db_file_len(&self) -> ChalkDBResult<u64> {
        let guard = self.db_file.lock();
        Ok(guard.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::DiskManager;
    use crate::buffer::PAGE_SIZE;
    use tempfile::TempDir;

    #[test]
    fn write_read_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let page_id1 = disk_manager.allocate_page().unwrap();
        assert_eq!(page_id1, 1);
        let mut page1 = vec![1u8, 2, 3];
        page1.extend(vec![0; PAGE_SIZE - 3]);
        disk_manager.write_page(page_id1, &page1).unwrap();
        assert_eq!(disk_manager.read_page(page_id1).unwrap(), page1.as_slice());

        let page_id2 = disk_manager.allocate_page().unwrap();
        assert_eq!(page_id2, 2);
        let mut page2 = vec![0u8; PAGE_SIZE - 3];
        page2.extend(vec![4, 5, 6]);
        disk_manager.write_page(page_id2, &page2).unwrap();
        assert_eq!(disk_manager.read_page(page_id2).unwrap(), page2.as_slice());
    }

    #[test]
    fn unwritten_page_reads_as_zeros() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();
        let page_id = disk_manager.allocate_page().unwrap();
        assert!(disk_manager
            .read_page(page_id)
            .unwrap()
            .iter()
            .all(|b| *b == 0));
    }

    #[test]
    fn allocation_is_monotonic_across_deallocate() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();
        let a = disk_manager.allocate_page().unwrap();
        let b = disk_manager.allocate_page().unwrap();
        assert!(b > a);
        disk_manager.write_page(a, &[7u8; PAGE_SIZE]).unwrap();
        disk_manager.deallocate_page(a).unwrap();
        assert!(disk_manager.read_page(a).unwrap().iter().all(|x| *x == 0));
        let c = disk_manager.allocate_page().unwrap();
        assert!(c > b);
    }

    #[test]
    fn reopen_resumes_allocation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        let last = {
            let disk_manager = DiskManager::try_new(&path).unwrap();
            let mut last = 0;
            for _ in 0..3 {
                last = disk_manager.allocate_page().unwrap();
                disk_manager.write_page(last, &[9u8; PAGE_SIZE]).unwrap();
            }
            last
        };
        let disk_manager = DiskManager::try_new(&path).unwrap();
        let next = disk_manager.allocate_page().unwrap();
        assert!(next > last);
    }
}
