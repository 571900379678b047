//! First-pass search driver.
//!
//! ## Lifecycle
//!
//! ```text
//! SearchDriver::new()
//!     └─► run(scorer, extender) → worker spawned, returns ArcBufferConsumer
//!         └─► stop()            → running=false, utterance finalized early
//!             └─► join()        → worker reaped, UttResult returned
//! ```
//!
//! The worker owns the backpointer table and the producing half of the arc
//! buffer; nothing else ever touches them, so the whole forward pass runs
//! without a single lock on the table. Per frame it asks the
//! [`FrameScorer`] for acoustic scores, lets the [`WordExtender`] record
//! word exits, commits the frame, and every `sweep_interval` frames streams
//! newly stable exits to the second pass through the arc buffer.
//!
//! `stop()` is cooperative: the worker notices the flag at the next frame
//! boundary and runs the normal ending path, so a blocked second pass is
//! always woken by the final arc commit — cancellation and end-of-input are
//! the same shutdown shape.

mod events;

pub use events::{PassEvent, PassStatus};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, info_span};

use crate::arcs::{arc_buffer, ArcBufferConsumer, ArcBufferProducer};
use crate::bptbl::{BpIdx, BpTable, BpTableConfig, Hypothesis, Segment};
use crate::dict::{Dictionary, TiedStateMap};
use crate::error::{Result, TrellisError};

/// Acoustic scores for one frame.
#[derive(Debug, Clone)]
pub struct FrameScores {
    /// Frame index; must match the table's frame counter.
    pub frame: u32,
    /// Senone scores for this frame, indexed by senone ID.
    pub senone_scores: Vec<i32>,
}

/// Source of per-frame acoustic scores (the feature/GMM front half).
pub trait FrameScorer: Send + 'static {
    fn start_utt(&mut self) -> Result<()>;

    /// Next frame of scores, `None` at end of input.
    fn next(&mut self) -> Result<Option<FrameScores>>;

    fn end_utt(&mut self) -> Result<()>;
}

/// The HMM-network half of the forward pass: evaluates word-internal state
/// transitions for one frame and records word exits in the table.
pub trait WordExtender: Send + 'static {
    fn start_utt(&mut self, _bptbl: &mut BpTable) -> Result<()> {
        Ok(())
    }

    /// Process one frame. Every word exit crossing a word boundary in this
    /// frame is recorded with `bptbl.enter`.
    ///
    /// Returns the oldest backpointer still reachable from live paths, which
    /// bounds the table's garbage-collection window for the next frame.
    /// `None` means no path older than the current frame survives.
    fn extend_frame(
        &mut self,
        frame: u32,
        scores: &FrameScores,
        bptbl: &mut BpTable,
    ) -> Result<Option<BpIdx>>;
}

/// Configuration for [`SearchDriver`].
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Sweep committed exits to the arc buffer every this many frames.
    /// Default: 8.
    pub sweep_interval: u32,
    /// Attach forward-pass scores to streamed arcs. Default: false.
    pub keep_scores: bool,
    /// Reclaim swept table entries immediately instead of waiting for the
    /// consumer. Only safe when nothing reads old backpointers after the
    /// sweep. Default: false.
    pub release_swept: bool,
    pub bptbl: BpTableConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            sweep_interval: 8,
            keep_scores: false,
            release_swept: false,
            bptbl: BpTableConfig::default(),
        }
    }
}

/// Completed-utterance output of the forward pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UttResult {
    /// Best path, `None` when no exit survived to the final frame.
    pub hyp: Option<Hypothesis>,
    /// Spellings of the best path, in utterance order.
    pub words: Vec<String>,
    pub segments: Vec<Segment>,
    pub n_frames: u32,
}

/// Top-level forward-pass controller.
///
/// All fields use interior mutability or are owned by the worker, so a
/// driver can be shared behind `Arc` with an embedding application.
pub struct SearchDriver {
    config: SearchConfig,
    dict: Arc<dyn Dictionary>,
    d2p: Arc<dyn TiedStateMap>,
    /// `true` while the worker decodes frames.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<PassStatus>>,
    result: Arc<Mutex<Option<UttResult>>>,
    event_tx: Sender<PassEvent>,
    event_rx: Receiver<PassEvent>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl SearchDriver {
    pub fn new(
        config: SearchConfig,
        dict: Arc<dyn Dictionary>,
        d2p: Arc<dyn TiedStateMap>,
    ) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            config,
            dict,
            d2p,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(PassStatus::Idle)),
            result: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx,
            worker: None,
        }
    }

    /// Start decoding one utterance on a worker thread.
    ///
    /// Returns the consuming half of the arc buffer for the second pass.
    /// The previous utterance must have been reaped with [`join`](Self::join).
    pub fn run<S, E>(&mut self, scorer: S, extender: E) -> Result<ArcBufferConsumer>
    where
        S: FrameScorer,
        E: WordExtender,
    {
        if self.running.load(Ordering::SeqCst) {
            return Err(TrellisError::AlreadyRunning);
        }
        let bptbl = BpTable::new(self.dict.clone(), self.d2p.clone(), self.config.bptbl)?;
        let (producer, consumer) = arc_buffer("fwd", self.config.keep_scores);
        self.running.store(true, Ordering::SeqCst);

        let ctx = WorkerCtx {
            config: self.config.clone(),
            dict: self.dict.clone(),
            running: self.running.clone(),
            status: self.status.clone(),
            result: self.result.clone(),
            events: self.event_tx.clone(),
        };
        *self.result.lock() = None;
        self.worker = Some(std::thread::spawn(move || {
            let span = info_span!("forward_pass");
            let _guard = span.enter();
            let out = ctx.decode_utt(scorer, extender, bptbl, producer);
            ctx.running.store(false, Ordering::SeqCst);
            *ctx.status.lock() = PassStatus::Idle;
            let _ = ctx.events.send(PassEvent::Status {
                status: PassStatus::Idle,
            });
            if let Err(e) = &out {
                error!(error = %e, "forward pass failed");
                let _ = ctx.events.send(PassEvent::Failed {
                    message: e.to_string(),
                });
            }
            out
        }));
        Ok(consumer)
    }

    /// Ask the worker to finish the utterance at the next frame boundary.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TrellisError::NotRunning);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("stop requested");
        Ok(())
    }

    /// Reap the worker and return the utterance result.
    pub fn join(&mut self) -> Result<UttResult> {
        let handle = self.worker.take().ok_or(TrellisError::NotRunning)?;
        handle
            .join()
            .map_err(|_| TrellisError::Other(anyhow::anyhow!("forward pass worker panicked")))??;
        self.result()
    }

    /// Result of the most recent utterance.
    pub fn result(&self) -> Result<UttResult> {
        self.result.lock().clone().ok_or(TrellisError::NotReady)
    }

    pub fn status(&self) -> PassStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Progress event stream. Events are queued, so a subscriber attached
    /// after `run` still sees everything.
    pub fn events(&self) -> Receiver<PassEvent> {
        self.event_rx.clone()
    }
}

/// Everything the worker thread needs, detached from the driver handle.
struct WorkerCtx {
    config: SearchConfig,
    dict: Arc<dyn Dictionary>,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<PassStatus>>,
    result: Arc<Mutex<Option<UttResult>>>,
    events: Sender<PassEvent>,
}

impl WorkerCtx {
    fn set_status(&self, status: PassStatus) {
        *self.status.lock() = status;
        let _ = self.events.send(PassEvent::Status { status });
    }

    fn decode_utt<S, E>(
        &self,
        mut scorer: S,
        mut extender: E,
        mut bptbl: BpTable,
        mut producer: ArcBufferProducer,
    ) -> Result<()>
    where
        S: FrameScorer,
        E: WordExtender,
    {
        scorer.start_utt()?;
        extender.start_utt(&mut bptbl)?;
        self.set_status(PassStatus::Decoding);

        let mut oldest: Option<BpIdx> = None;
        while self.running.load(Ordering::SeqCst) {
            let Some(scores) = scorer.next()? else {
                break;
            };
            let frame = bptbl.push_frame(oldest);
            if scores.frame != frame {
                return Err(TrellisError::FrameMismatch {
                    expected: frame,
                    found: scores.frame,
                });
            }
            let reachable = extender.extend_frame(frame, &scores, &mut bptbl)?;
            bptbl.commit()?;
            oldest = reachable.and_then(|b| bptbl.remap(b));

            if (frame + 1) % self.config.sweep_interval == 0 {
                producer.extend(bptbl.active_sf());
                producer.sweep(&mut bptbl, self.config.release_swept)?;
                producer.commit();
                let _ = self.events.send(PassEvent::Frontier {
                    next_sf: bptbl.active_sf(),
                });
            }
        }

        self.set_status(PassStatus::Ending);
        bptbl.finalize()?;
        producer.finalize(&mut bptbl, self.config.release_swept)?;
        scorer.end_utt()?;

        let n_frames = bptbl.frame_idx();
        let hyp = match bptbl.hyp(None) {
            Ok(h) => Some(h),
            Err(TrellisError::NoExit { .. }) => None,
            Err(e) => return Err(e),
        };
        let segments: Vec<Segment> = match bptbl.seg_iter(None) {
            Ok(iter) => iter.collect(),
            Err(TrellisError::NoExit { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let words: Vec<String> = hyp
            .as_ref()
            .map(|h| h.wids.iter().map(|&w| self.dict.word(w).to_string()).collect())
            .unwrap_or_default();
        let score = hyp.as_ref().map(|h| h.score).unwrap_or(0);

        debug!(n_frames, n_words = words.len(), score, "utterance decoded");
        let _ = self.events.send(PassEvent::Hypothesis {
            words: words.clone(),
            score,
            segments: segments.clone(),
            n_frames,
        });
        *self.result.lock() = Some(UttResult {
            hyp,
            words,
            segments,
            n_frames,
        });
        Ok(())
    }
}

/// Consumer side of the two-pass split: rescoring logic fed by the arc
/// stream.
pub trait SecondPass {
    /// Called once per committed arc, in start-frame order.
    fn on_arc(&mut self, arc: &crate::arcs::WordArc) -> Result<()>;

    /// Called after the final arc, once the stream is complete.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drive a [`SecondPass`] from an arc stream until it is finalized.
///
/// Blocks between frontier advances; pairs with a [`SearchDriver`] running
/// on another thread. Consumed frames are released as soon as the pass has
/// seen them.
pub fn run_second_pass<P: SecondPass>(consumer: &ArcBufferConsumer, pass: &mut P) -> Result<()> {
    let mut frontier = 0u32;
    loop {
        let next = consumer.wait(None);
        let is_final = {
            let rd = consumer.lock();
            if next > frontier {
                if let Some(arcs) = rd.iter(frontier) {
                    for arc in arcs {
                        pass.on_arc(arc)?;
                    }
                }
            }
            rd.is_final()
        };
        consumer.release(next);
        if is_final && next == frontier {
            break;
        }
        frontier = next;
    }
    pass.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arcs::WordArc;
    use crate::dict::{StaticDict, UniformTiedStateMap, WordId};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Scripted scorer: hands out `n_frames` frames of dummy scores.
    struct ScriptedScorer {
        n_frames: u32,
        next: u32,
        frame_delay: Duration,
        started: Arc<AtomicUsize>,
        ended: Arc<AtomicUsize>,
    }

    impl ScriptedScorer {
        fn new(n_frames: u32) -> Self {
            Self {
                n_frames,
                next: 0,
                frame_delay: Duration::ZERO,
                started: Arc::new(AtomicUsize::new(0)),
                ended: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl FrameScorer for ScriptedScorer {
        fn start_utt(&mut self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn next(&mut self) -> Result<Option<FrameScores>> {
            if self.next >= self.n_frames {
                return Ok(None);
            }
            if !self.frame_delay.is_zero() {
                std::thread::sleep(self.frame_delay);
            }
            let frame = self.next;
            self.next += 1;
            Ok(Some(FrameScores {
                frame,
                senone_scores: vec![-1; 4],
            }))
        }

        fn end_utt(&mut self) -> Result<()> {
            self.ended.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Scripted extender: one word exit per frame, chained into a single
    /// path.
    struct ChainExtender {
        wids: Vec<WordId>,
        prev: Option<BpIdx>,
    }

    impl ChainExtender {
        fn new(wids: Vec<WordId>) -> Self {
            Self { wids, prev: None }
        }
    }

    impl WordExtender for ChainExtender {
        fn extend_frame(
            &mut self,
            frame: u32,
            _scores: &FrameScores,
            bptbl: &mut BpTable,
        ) -> Result<Option<BpIdx>> {
            let wid = self.wids[frame as usize % self.wids.len()];
            let idx = bptbl.enter(wid, self.prev, -((frame as i32 + 1) * 10), 0)?;
            self.prev = Some(idx);
            Ok(self.prev)
        }
    }

    fn fixture() -> (Arc<StaticDict>, Arc<UniformTiedStateMap>, Vec<WordId>) {
        let mut dict = StaticDict::new();
        let wids = vec![
            dict.add_word("ONE", vec![1], false),
            dict.add_word("TWO", vec![2], false),
            dict.add_word("THREE", vec![3], false),
        ];
        (Arc::new(dict), Arc::new(UniformTiedStateMap::new(1)), wids)
    }

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn full_utterance_produces_hypothesis_and_arcs() {
        let (dict, d2p, wids) = fixture();
        let mut driver = SearchDriver::new(SearchConfig::default(), dict, d2p);
        let scorer = ScriptedScorer::new(12);
        let (started, ended) = (scorer.started.clone(), scorer.ended.clone());
        let consumer = driver
            .run(scorer, ChainExtender::new(wids.clone()))
            .unwrap();

        let result = driver.join().unwrap();
        assert_eq!(result.n_frames, 12);
        assert_eq!(result.words.len(), 12);
        assert_eq!(result.words[0], "ONE");
        assert_eq!(result.words[1], "TWO");
        assert_eq!(result.hyp.as_ref().unwrap().score, -120);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        // the arc stream carries every word exit
        assert_eq!(consumer.wait(Some(Duration::ZERO)), 12);
        let rd = consumer.lock();
        assert!(rd.is_final());
        assert_eq!(rd.iter(0).unwrap().count(), 12);
        let sfs: Vec<u32> = rd.iter(0).unwrap().map(|a| a.sf).collect();
        assert_eq!(sfs, (0..12).collect::<Vec<u32>>());
    }

    #[test]
    fn empty_utterance_yields_no_hypothesis() {
        let (dict, d2p, wids) = fixture();
        let mut driver = SearchDriver::new(SearchConfig::default(), dict, d2p);
        let consumer = driver
            .run(ScriptedScorer::new(0), ChainExtender::new(wids))
            .unwrap();
        let result = driver.join().unwrap();
        assert_eq!(result.n_frames, 0);
        assert!(result.hyp.is_none());
        assert!(result.words.is_empty());
        assert!(consumer.lock().is_final());
    }

    #[test]
    fn run_while_running_is_rejected() {
        let (dict, d2p, wids) = fixture();
        let mut driver = SearchDriver::new(SearchConfig::default(), dict, d2p);
        let mut scorer = ScriptedScorer::new(10_000);
        scorer.frame_delay = Duration::from_millis(1);
        let _consumer = driver.run(scorer, ChainExtender::new(wids.clone())).unwrap();
        assert!(matches!(
            driver.run(ScriptedScorer::new(1), ChainExtender::new(wids)),
            Err(TrellisError::AlreadyRunning)
        ));
        driver.stop().unwrap();
        driver.join().unwrap();
    }

    #[test]
    fn stop_finalizes_early_and_wakes_the_consumer() {
        let (dict, d2p, wids) = fixture();
        let mut driver = SearchDriver::new(SearchConfig::default(), dict, d2p);
        let mut scorer = ScriptedScorer::new(100_000);
        scorer.frame_delay = Duration::from_millis(1);
        let consumer = driver.run(scorer, ChainExtender::new(wids)).unwrap();
        assert!(wait_until(
            || driver.status() == PassStatus::Decoding,
            Duration::from_secs(5)
        ));
        driver.stop().unwrap();
        let result = driver.join().unwrap();
        assert!(result.n_frames < 100_000);
        // an indefinitely-blocking wait returns because the stream finalized
        assert_eq!(consumer.wait(None), result.n_frames);
        assert!(consumer.lock().is_final());
        assert!(!driver.is_running());
        assert!(matches!(driver.stop(), Err(TrellisError::NotRunning)));
    }

    #[test]
    fn driver_is_reusable_across_utterances() {
        let (dict, d2p, wids) = fixture();
        let mut driver = SearchDriver::new(SearchConfig::default(), dict, d2p);
        for n in [3u32, 5] {
            let _consumer = driver
                .run(ScriptedScorer::new(n), ChainExtender::new(wids.clone()))
                .unwrap();
            let result = driver.join().unwrap();
            assert_eq!(result.n_frames, n);
            assert_eq!(result.words.len(), n as usize);
        }
    }

    #[test]
    fn result_before_completion_is_not_ready() {
        let (dict, d2p, _) = fixture();
        let driver = SearchDriver::new(SearchConfig::default(), dict, d2p);
        assert!(matches!(driver.result(), Err(TrellisError::NotReady)));
    }

    #[test]
    fn misnumbered_scorer_frames_fail_the_pass() {
        struct OffByOne(ScriptedScorer);
        impl FrameScorer for OffByOne {
            fn start_utt(&mut self) -> Result<()> {
                self.0.start_utt()
            }
            fn next(&mut self) -> Result<Option<FrameScores>> {
                Ok(self.0.next()?.map(|mut s| {
                    s.frame += 1;
                    s
                }))
            }
            fn end_utt(&mut self) -> Result<()> {
                self.0.end_utt()
            }
        }

        let (dict, d2p, wids) = fixture();
        let mut driver = SearchDriver::new(SearchConfig::default(), dict, d2p);
        let _consumer = driver
            .run(OffByOne(ScriptedScorer::new(4)), ChainExtender::new(wids))
            .unwrap();
        let err = driver.join().unwrap_err();
        assert!(matches!(
            err,
            TrellisError::FrameMismatch {
                expected: 0,
                found: 1
            }
        ));
        let failed = driver
            .events()
            .try_iter()
            .any(|e| matches!(e, PassEvent::Failed { .. }));
        assert!(failed);
    }

    #[test]
    fn second_pass_sees_every_arc_in_order() {
        struct Collect {
            sfs: Vec<u32>,
            finished: bool,
        }
        impl SecondPass for Collect {
            fn on_arc(&mut self, arc: &WordArc) -> Result<()> {
                self.sfs.push(arc.sf);
                Ok(())
            }
            fn finish(&mut self) -> Result<()> {
                self.finished = true;
                Ok(())
            }
        }

        let (dict, d2p, wids) = fixture();
        let config = SearchConfig {
            sweep_interval: 4,
            ..SearchConfig::default()
        };
        let mut driver = SearchDriver::new(config, dict, d2p);
        let consumer = driver
            .run(ScriptedScorer::new(20), ChainExtender::new(wids))
            .unwrap();
        let second = std::thread::spawn(move || {
            let mut pass = Collect {
                sfs: Vec::new(),
                finished: false,
            };
            run_second_pass(&consumer, &mut pass).unwrap();
            pass
        });
        driver.join().unwrap();
        let pass = second.join().unwrap();
        assert!(pass.finished);
        assert_eq!(pass.sfs, (0..20).collect::<Vec<u32>>());
    }
}
