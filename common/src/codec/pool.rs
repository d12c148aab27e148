//! エンコード・デコード用のワーカープール
//!
//! 色空間変換とエンコードは CPU 負荷が高いため、接続スレッドの外で
//! 実行します。ジョブに渡した画像やコーデックはジョブの所有物になり、
//! 結果は `JobHandle` から受け取ります。プール自体は待機しません。
//! 飽和しているかどうかは `is_saturated` で確認し、新しいフレームを
//! 投入するかどうかは呼び出し側が判断します。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, trace};
use parking_lot::Mutex;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// ジョブの結果を受け取るハンドル
pub struct JobHandle<T> {
    receiver: Receiver<T>,
}

impl<T> JobHandle<T> {
    /// 結果を待つ
    ///
    /// ジョブがパニックした、またはプールが停止した場合はエラーです。
    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .map_err(|_| Error::InvalidState("ジョブが結果を返さずに終了しました".to_string()))
    }

    /// 完了していれば結果を取り出す
    pub fn try_take(&self) -> Result<Option<T>> {
        match self.receiver.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::InvalidState(
                "ジョブが結果を返さずに終了しました".to_string(),
            )),
        }
    }
}

/// 固定サイズのワーカープール
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// `size` 本のワーカースレッドを起動
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(receiver, pending))?;
            workers.push(handle);
        }
        debug!(target: "pool", "{}: {} 本のワーカーを起動しました", name, size);

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers,
            pending,
        })
    }

    /// ジョブを投入
    pub fn submit<F, T>(&self, job: F) -> Result<JobHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::InvalidState(format!("{} は停止しています", self.name)))?;
        let (result_tx, result_rx) = mpsc::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        let boxed: Job = Box::new(move || {
            // 受け取り側が先に破棄されていても構わない
            let _ = result_tx.send(job());
        });
        if sender.send(boxed).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::InvalidState(format!("{} のワーカーが終了しています", self.name)));
        }
        trace!(target: "pool", "{}: ジョブを投入しました（未完了 {}）", self.name, self.pending());
        Ok(JobHandle { receiver: result_rx })
    }

    /// ワーカー数
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// 未完了のジョブ数
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// すべてのワーカーが埋まっているかどうか
    pub fn is_saturated(&self) -> bool {
        self.pending() >= self.size()
    }

    /// 新しいジョブの受付を止め、投入済みのジョブが終わるまで待つ（冪等）
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(target: "pool", "{}: ワーカースレッドが異常終了しました", self.name);
            }
        }
        debug!(target: "pool", "{}: 停止しました", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>, pending: Arc<AtomicUsize>) {
    loop {
        // ロックは受信の間だけ保持する
        let job = receiver.lock().recv();
        let Ok(job) = job else {
            break;
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(target: "pool", "ジョブがパニックしました");
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_results_come_back() {
        let pool = WorkerPool::new("test", 3).unwrap();
        let handles: Vec<_> = (0..10u64).map(|i| pool.submit(move || i * i).unwrap()).collect();
        let results: Vec<u64> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, (0..10u64).map(|i| i * i).collect::<Vec<_>>());
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_saturation_and_drain() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocked = pool
            .submit(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                1
            })
            .unwrap();
        assert!(pool.is_saturated());
        assert!(blocked.try_take().unwrap().is_none());
        release_tx.send(()).unwrap();
        assert_eq!(blocked.wait().unwrap(), 1);
        // 結果の送信とカウンタの更新には僅かな差がある
        for _ in 0..100 {
            if pool.pending() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!pool.is_saturated());
    }

    #[test]
    fn test_panicking_job() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let handle = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert!(matches!(handle.wait(), Err(Error::InvalidState(_))));
        // ワーカーは生き残っている
        assert_eq!(pool.submit(|| 7).unwrap().wait().unwrap(), 7);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let mut pool = WorkerPool::new("test", 2).unwrap();
        let handle = pool.submit(|| "done").unwrap();
        pool.shutdown();
        assert_eq!(handle.wait().unwrap(), "done");
        assert!(matches!(pool.submit(|| ()), Err(Error::InvalidState(_))));
        pool.shutdown();
    }
}
