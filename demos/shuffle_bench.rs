// In demos/shuffle_bench.rs
//
// All-to-all over an in-process loopback fabric. Every payload carries the
// sha256 of its (src, dst, seq) label so the receivers can check it.
use hop_shuffle::Core::LoopbackFabric;
use hop_shuffle::{Message, Rank, Shuffle, ShuffleBuilder};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn label_hash(src: Rank, dst: Rank, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("message_{src}_{dst}_{seq}").as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Default)]
struct Tally {
    ok: AtomicU64,
    bad: AtomicU64,
}

impl Tally {
    fn check(&self, msg: &Message) {
        let text = String::from_utf8_lossy(&msg.payload);
        let valid = text
            .split_once(':')
            .and_then(|(seq, hash)| seq.parse::<u64>().ok().map(|seq| (seq, hash)))
            .map_or(false, |(seq, hash)| hash == label_hash(msg.src, msg.dst, seq));
        if valid {
            self.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bad.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!("Usage: {} <nodes> <procs_per_node> <messages_per_pair>", args[0]);
        std::process::exit(1);
    }
    let nodes: usize = args[1].parse()?;
    let ppn: usize = args[2].parse()?;
    let per_pair: u64 = args[3].parse()?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })?;

    let fabric = LoopbackFabric::new(nodes, ppn)?;
    let size = fabric.size();
    let tally = Arc::new(Tally::default());

    // SHUFFLE_* variables tune every rank the same way.
    let mut shuffles: Vec<Shuffle> = Vec::with_capacity(size);
    for rank in 0..size as Rank {
        let endpoint = fabric.fabric(rank);
        let tally = Arc::clone(&tally);
        shuffles.push(ShuffleBuilder::from_env()?.build(
            endpoint.topology,
            endpoint.transport,
            move |msg: Message| tally.check(&msg),
        )?);
    }
    println!(
        "Bench: {} ranks ({} nodes x {}), {} messages per pair",
        size, nodes, ppn, per_pair
    );

    let start = Instant::now();
    let sent: u64 = std::thread::scope(|scope| {
        let workers: Vec<_> = shuffles
            .iter()
            .map(|shuffle| {
                let running = &running;
                scope.spawn(move || {
                    let me = shuffle.rank();
                    let mut sent = 0u64;
                    'send: for seq in 0..per_pair {
                        for dst in 0..size as Rank {
                            if !running.load(Ordering::SeqCst) {
                                break 'send;
                            }
                            let payload = format!("{}:{}", seq, label_hash(me, dst, seq));
                            match shuffle.enqueue(dst, 0, payload.as_bytes()) {
                                Ok(()) => sent += 1,
                                Err(e) => eprintln!("rank {me}: send to {dst} failed: {e}"),
                            }
                        }
                    }
                    // Every rank must reach quiesce, stopped early or not.
                    if let Err(e) = shuffle.quiesce() {
                        eprintln!("rank {me}: quiesce failed: {e}");
                    }
                    sent
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap_or(0)).sum()
    });
    let elapsed = start.elapsed();

    let ok = tally.ok.load(Ordering::Relaxed);
    let bad = tally.bad.load(Ordering::Relaxed);
    println!("Bench: sent {} messages in {:.2?}", sent, elapsed);
    println!(
        "Bench: Throughput: {:.2} messages/sec",
        sent as f64 / elapsed.as_secs_f64()
    );
    println!("Bench: verified {} ok, {} bad, {} missing", ok, bad, sent.saturating_sub(ok + bad));
    println!("Bench: {} RPCs on the fabric", fabric.total_rpcs());
    for shuffle in &shuffles {
        let stats = shuffle.stats();
        println!(
            "  rank {:>3}: local {}/{} remote {}/{} relayed {} delivered {}",
            shuffle.rank(),
            stats.local.sends,
            stats.local.recvs,
            stats.remote.sends,
            stats.remote.recvs,
            stats.relayed,
            stats.delivered
        );
    }

    for shuffle in shuffles {
        shuffle.shutdown()?;
    }
    if bad > 0 || ok != sent {
        std::process::exit(2);
    }
    Ok(())
}
