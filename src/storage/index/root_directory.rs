use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferPoolManager, PageId, HEADER_PAGE_ID};
use crate::error::{ChalkDBError, ChalkDBResult};
use crate::storage::codec::HeaderPageCodec;
use crate::storage::page::HeaderPage;

/// Service over the header page (page 0): the persistent directory from
/// index name to root page id. All mutations go through one mutex so
/// read-modify-write of the page is atomic; the page itself travels
/// through the buffer pool like any other page.
#[derive(Debug)]
pub struct RootDirectory {
    buffer_pool: Arc<BufferPoolManager>,
    latch: Mutex<()>,
}

impl RootDirectory {
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            latch: Mutex::new(()),
        }
    }

    pub fn create_index(&self, name: &str, root_page_id: PageId) -> ChalkDBResult<()> {
        let _guard = self.latch.lock();
        let mut page_guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let (mut header, _) = HeaderPageCodec::decode(page_guard.data())?;
        if !header.insert_record(name, root_page_id) {
            return Err(ChalkDBError::Storage(format!(
                "index {} already exists",
                name
            )));
        }
        page_guard.overwrite(&HeaderPageCodec::encode(&header));
        Ok(())
    }

    pub fn update_root(&self, name: &str, root_page_id: PageId) -> ChalkDBResult<()> {
        let _guard = self.latch.lock();
        let mut page_guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let (mut header, _) = HeaderPageCodec::decode(page_guard.data())?;
        if !header.update_record(name, root_page_id) {
            return Err(ChalkDBError::Storage(format!("index {} not found", name)));
        }
        page_guard.overwrite(&HeaderPageCodec::encode(&header));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> ChalkDBResult<Option<PageId>> {
        let page_guard = self.buffer_pool.fetch_page_read(HEADER_PAGE_ID)?;
        let (header, _) = HeaderPageCodec::decode(page_guard.data())?;
        Ok(header.get_record(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::INVALID_PAGE_ID;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        (temp_dir, Arc::new(BufferPoolManager::new(8, disk_scheduler)))
    }

    #[test]
    fn create_update_lookup() {
        let (_tmp, bpm) = setup();
        let directory = RootDirectory::new(bpm);

        assert_eq!(directory.lookup("pk").unwrap(), None);
        directory.create_index("pk", INVALID_PAGE_ID).unwrap();
        assert_eq!(directory.lookup("pk").unwrap(), Some(INVALID_PAGE_ID));
        assert!(directory.create_index("pk", 5).is_err());

        directory.update_root("pk", 5).unwrap();
        assert_eq!(directory.lookup("pk").unwrap(), Some(5));
        assert!(directory.update_root("other", 1).is_err());
    }

    #[test]
    fn directory_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        {
            let disk_manager = Arc::new(DiskManager::try_new(&path).unwrap());
            let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
            let bpm = Arc::new(BufferPoolManager::new(8, disk_scheduler));
            let directory = RootDirectory::new(bpm.clone());
            directory.create_index("pk", 17).unwrap();
            bpm.flush_all_pages().unwrap();
        }
        let disk_manager = Arc::new(DiskManager::try_new(&path).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let bpm = Arc::new(BufferPoolManager::new(8, disk_scheduler));
        let directory = RootDirectory::new(bpm);
        assert_eq!(directory.lookup("pk").unwrap(), Some(17));
    }
}
