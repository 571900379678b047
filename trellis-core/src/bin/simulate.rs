//! Synthetic two-pass decode: a scripted frame scorer and word extender
//! drive the forward pass on one thread while a counting second pass
//! consumes the arc stream on another. Useful for eyeballing GC/streaming
//! behaviour and as a smoke test for the full pipeline.
//!
//! ```text
//! cargo run --bin simulate -- --frames 400 --vocab 20 --output report.json
//! ```

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis_core=info,simulate=info".parse().unwrap()),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("simulate failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use serde::Serialize;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Instant;
    use tracing::info;
    use trellis_core::{
        BpIdx, BpTable, FrameScorer, FrameScores, SearchConfig, SearchDriver, SecondPass,
        StaticDict, UniformTiedStateMap, WordArc, WordExtender, WordId,
    };
    use trellis_core::error::Result as TrellisResult;

    #[derive(Debug)]
    struct Args {
        frames: u32,
        vocab: usize,
        sweep_interval: u32,
        seed: u64,
        keep_scores: bool,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Summary {
        frames: u32,
        vocab: usize,
        sweep_interval: u32,
        seed: u64,
        elapsed_ms: f64,
        hyp_words: Vec<String>,
        hyp_score: i32,
        n_segments: usize,
        arcs_seen: usize,
        frontier_advances: usize,
        max_arcs_retained: usize,
    }

    fn parse_args() -> Result<Args, String> {
        let mut args = Args {
            frames: 200,
            vocab: 12,
            sweep_interval: 8,
            seed: 0x5eed,
            keep_scores: false,
            output: None,
        };
        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--frames" => {
                    let v = it.next().ok_or("missing value for --frames")?;
                    args.frames = v.parse().map_err(|_| "invalid value for --frames")?;
                }
                "--vocab" => {
                    let v = it.next().ok_or("missing value for --vocab")?;
                    args.vocab = v.parse().map_err(|_| "invalid value for --vocab")?;
                }
                "--sweep-interval" => {
                    let v = it.next().ok_or("missing value for --sweep-interval")?;
                    args.sweep_interval =
                        v.parse().map_err(|_| "invalid value for --sweep-interval")?;
                }
                "--seed" => {
                    let v = it.next().ok_or("missing value for --seed")?;
                    args.seed = v.parse().map_err(|_| "invalid value for --seed")?;
                }
                "--keep-scores" => args.keep_scores = true,
                "--output" => {
                    let v = it.next().ok_or("missing value for --output")?;
                    args.output = Some(PathBuf::from(v));
                }
                "--help" | "-h" => {
                    println!(
                        "usage: simulate [--frames <n>] [--vocab <n>] [--sweep-interval <n>] \
                         [--seed <n>] [--keep-scores] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        if args.frames == 0 || args.vocab == 0 {
            return Err("--frames and --vocab must be positive".into());
        }
        Ok(args)
    }

    /// xorshift64*, so runs are reproducible without a rand dependency.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x.wrapping_mul(0x2545_f491_4f6c_dd1d)
        }

        fn below(&mut self, n: usize) -> usize {
            (self.next() % n as u64) as usize
        }
    }

    struct SyntheticScorer {
        frames: u32,
        next: u32,
        rng: Rng,
    }

    impl FrameScorer for SyntheticScorer {
        fn start_utt(&mut self) -> TrellisResult<()> {
            Ok(())
        }

        fn next(&mut self) -> TrellisResult<Option<FrameScores>> {
            if self.next >= self.frames {
                return Ok(None);
            }
            let frame = self.next;
            self.next += 1;
            let senone_scores = (0..32)
                .map(|_| -((self.rng.below(2000) as i32) + 1))
                .collect();
            Ok(Some(FrameScores {
                frame,
                senone_scores,
            }))
        }

        fn end_utt(&mut self) -> TrellisResult<()> {
            Ok(())
        }
    }

    /// Keeps a handful of live paths and extends a random subset each frame,
    /// so the table sees branching, dead ends, and a moving GC window.
    struct SyntheticExtender {
        wids: Vec<WordId>,
        live: Vec<BpIdx>,
        rng: Rng,
    }

    impl WordExtender for SyntheticExtender {
        fn extend_frame(
            &mut self,
            frame: u32,
            scores: &FrameScores,
            bptbl: &mut BpTable,
        ) -> TrellisResult<Option<BpIdx>> {
            // previous-frame indices survived the last compaction; remap
            let live: Vec<BpIdx> = self
                .live
                .iter()
                .filter_map(|&b| bptbl.remap(b))
                .collect();
            let base = scores.senone_scores[frame as usize % scores.senone_scores.len()];
            let n_exits = 1 + self.rng.below(3);
            let mut next_live = Vec::with_capacity(n_exits);
            for i in 0..n_exits {
                let wid = self.wids[self.rng.below(self.wids.len())];
                let prev = if live.is_empty() {
                    None
                } else {
                    Some(live[self.rng.below(live.len())])
                };
                let prev_score = match prev {
                    Some(p) => bptbl.ent(p)?.score,
                    None => 0,
                };
                let score = prev_score + base - self.rng.below(500) as i32;
                let idx = bptbl.enter(wid, prev, score, 0)?;
                // occasionally prune a weak extra exit; the first always
                // survives so every frame keeps a live path
                if i > 0 && self.rng.below(10) == 0 {
                    bptbl.invalidate(idx)?;
                } else {
                    next_live.push(idx);
                }
            }
            self.live = next_live;
            Ok(self.live.iter().copied().min())
        }
    }

    #[derive(Default)]
    struct CountingPass {
        arcs_seen: usize,
    }

    impl SecondPass for CountingPass {
        fn on_arc(&mut self, _arc: &WordArc) -> TrellisResult<()> {
            self.arcs_seen += 1;
            Ok(())
        }
    }

    let args = parse_args()?;
    info!(?args, "starting synthetic decode");

    let mut dict = StaticDict::new();
    let wids: Vec<WordId> = (0..args.vocab)
        .map(|i| dict.add_word(&format!("WORD{i:03}"), vec![(i % 40) as u16, 3, 7], false))
        .collect();
    let dict = Arc::new(dict);
    let d2p = Arc::new(UniformTiedStateMap::new(3));

    let config = SearchConfig {
        sweep_interval: args.sweep_interval,
        keep_scores: args.keep_scores,
        ..SearchConfig::default()
    };
    let mut driver = SearchDriver::new(config, dict, d2p);
    let events = driver.events();

    let started = Instant::now();
    let consumer = driver
        .run(
            SyntheticScorer {
                frames: args.frames,
                next: 0,
                rng: Rng(args.seed | 1),
            },
            SyntheticExtender {
                wids,
                live: Vec::new(),
                rng: Rng((args.seed ^ 0x9e37_79b9) | 1),
            },
        )
        .map_err(|e| e.to_string())?;

    let second = std::thread::spawn(move || -> Result<(CountingPass, usize), String> {
        let mut pass = CountingPass::default();
        let mut max_retained = 0usize;
        // track retention by hand instead of using run_second_pass, so the
        // report can include the high-water mark
        let mut frontier = 0u32;
        loop {
            let next = consumer.wait(None);
            let is_final = {
                let rd = consumer.lock();
                max_retained = max_retained.max(rd.len());
                if next > frontier {
                    if let Some(arcs) = rd.iter(frontier) {
                        for arc in arcs {
                            pass.on_arc(arc).map_err(|e| e.to_string())?;
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
        pass.finish().map_err(|e| e.to_string())?;
        Ok((pass, max_retained))
    });

    let result = driver.join().map_err(|e| e.to_string())?;
    let (pass, max_retained) = second.join().map_err(|_| "second pass panicked")??;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let frontier_advances = events
        .try_iter()
        .filter(|e| matches!(e, trellis_core::PassEvent::Frontier { .. }))
        .count();

    let summary = Summary {
        frames: args.frames,
        vocab: args.vocab,
        sweep_interval: args.sweep_interval,
        seed: args.seed,
        elapsed_ms,
        hyp_words: result.words.clone(),
        hyp_score: result.hyp.as_ref().map(|h| h.score).unwrap_or(0),
        n_segments: result.segments.len(),
        arcs_seen: pass.arcs_seen,
        frontier_advances,
        max_arcs_retained: max_retained,
    };
    info!(
        elapsed_ms = summary.elapsed_ms,
        n_words = summary.hyp_words.len(),
        arcs_seen = summary.arcs_seen,
        max_arcs_retained = summary.max_arcs_retained,
        "decode finished"
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        std::fs::write(&out, &json).map_err(|e| e.to_string())?;
        println!("Wrote simulation report: {}", out.display());
    } else {
        println!("{json}");
    }
    Ok(())
}
