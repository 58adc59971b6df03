use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use sudoku_tunnel::obfs::{PackedStream, SudokuStream, Table};

fn bench_sudoku_stream(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let table = Arc::new(Table::new("bench-key", "prefer_entropy", "").unwrap());
    let payload = vec![0x5Au8; 64 * 1024];

    let mut group = c.benchmark_group("sudoku_stream");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("encode_decode_64k", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (a, bh) = tokio::io::duplex(8 * 1024 * 1024);
                let mut writer = SudokuStream::new(a, table.clone(), 5, 15, None);
                let mut reader = SudokuStream::new(bh, table.clone(), 5, 15, None);

                let data = payload.clone();
                let task = tokio::spawn(async move {
                    writer.write_all(&data).await.unwrap();
                    writer.flush().await.unwrap();
                    drop(writer);
                });
                let mut out = vec![0u8; payload.len()];
                reader.read_exact(&mut out).await.unwrap();
                task.await.unwrap();
                out
            })
        });
    });
    group.finish();
}

fn bench_packed_stream(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let table = Arc::new(Table::new("bench-key", "prefer_entropy", "").unwrap());
    let payload = vec![0x5Au8; 64 * 1024];

    let mut group = c.benchmark_group("packed_stream");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("encode_decode_64k", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (a, bh) = tokio::io::duplex(8 * 1024 * 1024);
                let mut writer = PackedStream::new(a, table.clone(), 5, 15);
                let mut reader = PackedStream::new(bh, table.clone(), 5, 15);

                let data = payload.clone();
                let task = tokio::spawn(async move {
                    writer.write_all(&data).await.unwrap();
                    writer.flush().await.unwrap();
                    drop(writer);
                });
                let mut out = vec![0u8; payload.len()];
                reader.read_exact(&mut out).await.unwrap();
                task.await.unwrap();
                out
            })
        });
    });
    group.finish();
}

fn bench_table_build(c: &mut Criterion) {
    c.bench_function("table_build_entropy", |b| {
        b.iter(|| Table::new("bench-build-key", "prefer_entropy", "").unwrap());
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_sudoku_stream, bench_packed_stream, bench_table_build
}
criterion_main!(benches);
