use cinder_gpu::copy_to_mapped;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

#[repr(C, align(32))]
struct Staging([u8; 1 << 16]);

fn bench_copy(c: &mut Criterion) {
    let src = vec![0xA5u8; 1 << 16];
    let mut dst = Box::new(Staging([0; 1 << 16]));

    let mut group = c.benchmark_group("Mapped copy");
    for size in [256usize, 4096, 1 << 16] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("copy_to_mapped", size), &size, |b, &size| {
            b.iter(|| unsafe {
                copy_to_mapped(dst.0.as_mut_ptr(), black_box(&src[..size]));
            });
        });

        group.bench_with_input(BenchmarkId::new("copy_nonoverlapping", size), &size, |b, &size| {
            b.iter(|| unsafe {
                std::ptr::copy_nonoverlapping(black_box(src.as_ptr()), dst.0.as_mut_ptr(), size);
            });
        });

        // Misaligned destination forces the narrower chunk paths.
        group.bench_with_input(BenchmarkId::new("copy_to_mapped_offset_4", size), &size, |b, &size| {
            b.iter(|| unsafe {
                copy_to_mapped(dst.0.as_mut_ptr().add(4), black_box(&src[..size - 4]));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_copy);
criterion_main!(benches);
