use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use log::{debug, error};

use crate::buffer::PageId;
use crate::config::IoSchedulerConfig;
use crate::error::{ChalkDBError, ChalkDBResult};
use crate::storage::disk_manager::DiskManager;

pub type DiskCommandResultSender<T> = Sender<ChalkDBResult<T>>;
pub type DiskCommandResultReceiver<T> = Receiver<ChalkDBResult<T>>;

/// Requests handed from the buffer pool to the I/O workers. Every request
/// carries the sender half of a channel for its result.
#[derive(Debug)]
pub enum DiskRequest {
    ReadPage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<BytesMut>,
    },
    WritePage {
        page_id: PageId,
        data: Bytes,
        result_sender: DiskCommandResultSender<()>,
    },
    AllocatePage {
        result_sender: DiskCommandResultSender<PageId>,
    },
    DeallocatePage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<()>,
    },
    Shutdown,
}

/// Owns the background I/O threads: a dispatcher fans requests out to a
/// fixed pool of workers round-robin, and each worker drives the disk
/// manager synchronously.
#[derive(Debug)]
pub struct DiskScheduler {
    request_sender: Sender<DiskRequest>,
    dispatcher_thread: Option<thread::JoinHandle<()>>,
    worker_threads: Vec<thread::JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_config(disk_manager, IoSchedulerConfig::default())
    }

    pub fn new_with_config(disk_manager: Arc<DiskManager>, config: IoSchedulerConfig) -> Self {
        let worker_count = config.workers.max(1);
        let (request_sender, request_receiver) = mpsc::channel::<DiskRequest>();

        let mut worker_senders = Vec::with_capacity(worker_count);
        let mut worker_threads = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let (tx, rx) = mpsc::channel::<DiskRequest>();
            worker_senders.push(tx);
            let dm = disk_manager.clone();
            let handle = thread::Builder::new()
                .name(format!("disk-scheduler-worker-{}", i))
                .spawn(move || Self::worker_loop(rx, dm))
                .expect("failed to spawn disk scheduler worker");
            worker_threads.push(handle);
        }

        let dispatcher_thread = thread::Builder::new()
            .name("disk-scheduler-dispatcher".to_string())
            .spawn(move || Self::dispatcher_loop(request_receiver, worker_senders))
            .expect("failed to spawn disk scheduler dispatcher");

        Self {
            request_sender,
            dispatcher_thread: Some(dispatcher_thread),
            worker_threads,
        }
    }

    fn dispatcher_loop(receiver: Receiver<DiskRequest>, worker_senders: Vec<Sender<DiskRequest>>) {
        debug!("disk scheduler dispatcher started");
        let mut rr = 0usize;
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::Shutdown => {
                    for tx in &worker_senders {
                        let _ = tx.send(DiskRequest::Shutdown);
                    }
                    break;
                }
                other => {
                    let idx = rr % worker_senders.len();
                    rr = rr.wrapping_add(1);
                    if worker_senders[idx].send(other).is_err() {
                        error!("disk scheduler worker {} is gone", idx);
                        break;
                    }
                }
            }
        }
        debug!("disk scheduler dispatcher exited");
    }

    fn worker_loop(receiver: Receiver<DiskRequest>, disk_manager: Arc<DiskManager>) {
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::ReadPage {
                    page_id,
                    result_sender,
                } => {
                    let result = disk_manager
                        .read_page(page_id)
                        .map(|data| BytesMut::from(&data[..]));
                    let _ = result_sender.send(result);
                }
                DiskRequest::WritePage {
                    page_id,
                    data,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.write_page(page_id, &data));
                }
                DiskRequest::AllocatePage { result_sender } => {
                    let _ = result_sender.send(disk_manager.allocate_page());
                }
                DiskRequest::DeallocatePage {
                    page_id,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.deallocate_page(page_id));
                }
                DiskRequest::Shutdown => break,
            }
        }
    }

    fn send(&self, request: DiskRequest) -> ChalkDBResult<()> {
        self.request_sender
            .send(request)
            .map_err(|e| ChalkDBError::Internal(format!("disk scheduler is down: {}", e)))
    }

    pub fn schedule_read(
        &self,
        page_id: PageId,
    ) -> ChalkDBResult<DiskCommandResultReceiver<BytesMut>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::ReadPage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> ChalkDBResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::WritePage {
            page_id,
            data,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_allocate(&self) -> ChalkDBResult<DiskCommandResultReceiver<PageId>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::AllocatePage { result_sender: tx })?;
        Ok(rx)
    }

    pub fn schedule_deallocate(
        &self,
        page_id: PageId,
    ) -> ChalkDBResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::DeallocatePage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.request_sender.send(DiskRequest::Shutdown);
        if let Some(handle) = self.dispatcher_thread.take() {
            let _ = handle.join();
        }
        for handle in self.worker_threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PAGE_SIZE;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DiskScheduler) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        (temp_dir, DiskScheduler::new(disk_manager))
    }

    #[test]
    fn scheduled_write_then_read() {
        let (_tmp, scheduler) = setup();
        let page_id = scheduler
            .schedule_allocate()
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();

        let mut data = vec![42u8; PAGE_SIZE];
        data[0] = 7;
        scheduler
            .schedule_write(page_id, Bytes::from(data.clone()))
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();

        let read_back = scheduler
            .schedule_read(page_id)
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();
        assert_eq!(&read_back[..], &data[..]);
    }

    #[test]
    fn deallocate_zeroes_page() {
        let (_tmp, scheduler) = setup();
        let page_id = scheduler
            .schedule_allocate()
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();
        scheduler
            .schedule_write(page_id, Bytes::from(vec![1u8; PAGE_SIZE]))
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();
        scheduler
            .schedule_deallocate(page_id)
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();
        let read_back = scheduler
            .schedule_read(page_id)
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();
        assert!(read_back.iter().all(|b| *b == 0));
    }

    #[test]
    fn concurrent_requests_complete() {
        let (_tmp, scheduler) = setup();
        let scheduler = Arc::new(scheduler);
        let mut handles = Vec::new();
        for t in 0u8..4 {
            let scheduler = scheduler.clone();
            handles.push(std::thread::spawn(move || {
                let page_id = scheduler
                    .schedule_allocate()
                    .unwrap()
                    .recv()
                    .unwrap()
                    .unwrap();
                let data = vec![t; PAGE_SIZE];
                scheduler
                    .schedule_write(page_id, Bytes::from(data.clone()))
                    .unwrap()
                    .recv()
                    .unwrap()
                    .unwrap();
                let read_back = scheduler
                    .schedule_read(page_id)
                    .unwrap()
                    .recv()
                    .unwrap()
                    .unwrap();
                assert_eq!(&read_back[..], &data[..]);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
