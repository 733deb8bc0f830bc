//! Local candidate batching and diagnostics

use crate::peer::types::IceCandidate;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type FlushFn = Arc<dyn Fn(Vec<IceCandidate>) + Send + Sync>;

/// Groups trickled candidates into batches.
///
/// Every candidate restarts the countdown. The batch goes out when the
/// countdown expires or gathering completes, whichever comes first. With
/// batching disabled every candidate is flushed on its own.
pub struct CandidateBatcher {
    enabled: bool,
    timeout: Duration,
    pending: Arc<Mutex<Vec<IceCandidate>>>,
    timer: Option<JoinHandle<()>>,
    flush: FlushFn,
}

impl CandidateBatcher {
    pub fn new(enabled: bool, timeout: Duration, flush: FlushFn) -> Self {
        Self {
            enabled,
            timeout,
            pending: Arc::new(Mutex::new(Vec::new())),
            timer: None,
            flush,
        }
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        if !self.enabled {
            (self.flush)(vec![candidate]);
            return;
        }

        self.pending.lock().push(candidate);
        self.cancel_timer();

        let pending = Arc::clone(&self.pending);
        let flush = Arc::clone(&self.flush);
        let timeout = self.timeout;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let batch = std::mem::take(&mut *pending.lock());
            if !batch.is_empty() {
                debug!("Flushing {} candidates after timeout", batch.len());
                flush(batch);
            }
        }));
    }

    /// End of gathering: flush whatever is pending right away
    pub fn complete(&mut self) {
        self.cancel_timer();
        let batch = std::mem::take(&mut *self.pending.lock());
        if !batch.is_empty() {
            debug!("Gathering complete, flushing {} candidates", batch.len());
            (self.flush)(batch);
        }
    }

    /// Drop pending candidates without flushing
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.pending.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for CandidateBatcher {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

impl fmt::Debug for CandidateBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateBatcher")
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Per-type candidate counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            stats.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            stats.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            stats.relay += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        stats.host, stats.srflx, stats.relay
    );

    if stats.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (FlushFn, Arc<Mutex<Vec<Vec<IceCandidate>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let flush: FlushFn = Arc::new(move |batch: Vec<IceCandidate>| sink.lock().push(batch));
        (flush, batches)
    }

    fn cand(n: u16) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.1 {n} typ host"))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_complete_is_one_batch() {
        let (flush, batches) = collector();
        let mut batcher = CandidateBatcher::new(true, Duration::from_millis(200), flush);

        for n in 0..5 {
            batcher.push(cand(n));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        batcher.complete();

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
        assert_eq!(batches[0][0], cand(0));
        assert_eq!(batches[0][4], cand(4));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_candidates_flush_separately() {
        let (flush, batches) = collector();
        let mut batcher = CandidateBatcher::new(true, Duration::from_millis(200), flush);

        batcher.push(cand(1));
        batcher.push(cand(2));
        tokio::time::sleep(Duration::from_millis(250)).await;
        batcher.push(cand(3));
        tokio::time::sleep(Duration::from_millis(250)).await;
        batcher.complete();

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![cand(1), cand(2)]);
        assert_eq!(batches[1], vec![cand(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_drops_partial_batch() {
        let (flush, batches) = collector();
        let mut batcher = CandidateBatcher::new(true, Duration::from_millis(200), flush);

        batcher.push(cand(1));
        batcher.reset();
        tokio::time::sleep(Duration::from_millis(500)).await;
        batcher.complete();

        assert!(batches.lock().is_empty());
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn disabled_batching_flushes_each_candidate() {
        let (flush, batches) = collector();
        let mut batcher = CandidateBatcher::new(false, Duration::from_millis(200), flush);

        batcher.push(cand(1));
        batcher.push(cand(2));

        assert_eq!(*batches.lock(), vec![vec![cand(1)], vec![cand(2)]]);
    }

    #[test]
    fn analysis_counts_types() {
        let stats = analyze_candidates(&[
            IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"),
            IceCandidate::new("candidate:2 1 udp 1 1.2.3.4 2 typ srflx raddr 0.0.0.0"),
            IceCandidate::new("candidate:3 1 udp 1 5.6.7.8 3 typ relay raddr 0.0.0.0"),
        ]);
        assert_eq!(
            stats,
            CandidateStats {
                host: 1,
                srflx: 1,
                relay: 1
            }
        );
    }
}
