//! Benchmark: streaming attention on the simulator vs direct reference attention.

use hbmsim_attention::reference;
use hbmsim_attention::{calculate, Rater, RaterConfig};
use hbmsim_core::{Allocator, Matrix, Residency};
use hbmsim_device::GpuSimulator;
use std::time::Instant;

struct Sample {
    secs: f64,
    ops: usize,
    peak_sram: usize,
}

fn bench_streaming(cfg: &RaterConfig, iters: usize) -> Sample {
    let mut secs = 0.0;
    let mut ops = 0;
    let mut peak_sram = 0;
    for _ in 0..iters {
        let mut alloc = Allocator::new();
        let mut sim = GpuSimulator::default();
        let mut rater = Rater::random(&mut alloc, cfg).unwrap();
        let keys = rater.keys().to_vec();
        let values = rater.values().to_vec();

        let start = Instant::now();
        calculate(&keys, &values, &mut rater, &mut sim, &mut alloc).unwrap();
        secs += start.elapsed().as_secs_f64();

        ops = sim.stats().total_ops();
        peak_sram = alloc.peak_bytes(Residency::Sram);
        rater.release_all(&mut alloc).unwrap();
    }
    Sample {
        secs: secs / iters as f64,
        ops,
        peak_sram,
    }
}

/// Direct attention over the same growing prefix, one full recompute per round.
fn bench_reference(n: usize, d: usize) -> f64 {
    let data: Vec<f32> = (0..n * d).map(|i| ((i * 7 + 3) % 13) as f32 * 0.1 - 0.6).collect();
    let k = Matrix::from_f32(&data, n, d);
    let start = Instant::now();
    for i in 0..n {
        let rows = i + 1;
        let q = Matrix::from_f32(&data[..rows * d], rows, d);
        let kk = Matrix::from_f32(&k.as_slice()[..rows * d], rows, d);
        let _ = reference::attention(&q, &kk, &kk).unwrap();
    }
    start.elapsed().as_secs_f64()
}

fn main() {
    println!("=== Streaming Attention Benchmark ===\n");
    println!(
        "{:<14} {:>14} {:>14} {:>10} {:>14}",
        "Rounds x d", "Stream (ms)", "Direct (ms)", "Ops", "Peak SRAM (B)"
    );
    println!("{}", "-".repeat(70));

    let sizes: &[(usize, usize)] = &[(8, 16), (16, 16), (32, 32), (64, 32), (128, 64)];

    for &(rounds, dim) in sizes {
        let cfg = RaterConfig {
            rounds,
            dim,
            seed: 1,
            ..Default::default()
        };
        let iters = if rounds <= 16 { 20 } else if rounds <= 64 { 5 } else { 1 };

        let s = bench_streaming(&cfg, iters);
        let direct_s = bench_reference(rounds, dim);

        println!(
            "{:<14} {:>12.3}ms {:>12.3}ms {:>10} {:>14}",
            format!("{}x{}", rounds, dim),
            s.secs * 1000.0,
            direct_s * 1000.0,
            s.ops,
            s.peak_sram,
        );
    }
}
