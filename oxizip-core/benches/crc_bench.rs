//! CRC-32 throughput, one-shot versus streamed through the adapters.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use oxizip_core::crc::{Crc32, CrcReader};
use std::hint::black_box;
use std::io::Read;

fn text_like(size: usize) -> Vec<u8> {
    let text = b"The quick brown fox jumps over the lazy dog. ";
    text.iter().copied().cycle().take(size).collect()
}

fn bench_crc32(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32");
    for size in [4 * 1024, 256 * 1024, 4 * 1024 * 1024] {
        let data = text_like(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("compute", size), &data, |b, data| {
            b.iter(|| Crc32::compute(black_box(data)))
        });

        group.bench_with_input(BenchmarkId::new("reader", size), &data, |b, data| {
            b.iter(|| {
                let mut reader = CrcReader::new(black_box(data.as_slice()));
                let mut buf = [0u8; 16 * 1024];
                while let Ok(n) = reader.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                }
                reader.crc()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_crc32);
criterion_main!(benches);
