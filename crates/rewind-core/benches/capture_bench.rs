//! Capture-path throughput: the per-frame cost a host pays on the
//! simulation thread.

use std::io::Write;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rewind_core::{RingStateStore, StoreConfig};

const STATE_BYTES: usize = 1008;

fn capture_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture");
    group.throughput(Throughput::Bytes(STATE_BYTES as u64));

    for (name, use_compression) in [("raw", false), ("deflate", true)] {
        group.bench_function(name, |b| {
            let mut store = RingStateStore::new(&StoreConfig {
                buffer_mb: 16,
                target_frame_length: 1,
                use_compression,
            })
            .unwrap();
            let payload = vec![0xA5u8; STATE_BYTES];
            let mut frame = 0u64;
            b.iter(|| {
                store
                    .capture(
                        frame,
                        |w| Ok(w.write_all(&payload)?),
                        |_, _| Ok(()),
                        true,
                    )
                    .unwrap();
                frame += 1;
            });
        });
    }
    group.finish();
}

criterion_group!(benches, capture_throughput);
criterion_main!(benches);
