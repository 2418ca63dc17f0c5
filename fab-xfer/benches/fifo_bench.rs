use criterion::{Criterion, black_box, criterion_group, criterion_main};

use fab_xfer::fifo::Fifo;

fn bench_fifo(c: &mut Criterion) {
    c.bench_function("fifo_put_get_64", |b| {
        let mut fifo = Fifo::new(64);
        b.iter(|| {
            for i in 0..64u64 {
                fifo.put(black_box(i)).unwrap();
            }
            for _ in 0..64 {
                black_box(fifo.get());
            }
        });
    });

    c.bench_function("fifo_peek", |b| {
        let mut fifo = Fifo::new(64);
        fifo.put(7u64).unwrap();
        b.iter(|| black_box(fifo.peek()));
    });
}

criterion_group!(benches, bench_fifo);
criterion_main!(benches);
