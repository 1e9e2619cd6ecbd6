use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tempfile::TempDir;
use tidemark_core::archive::{ArchiveCodec, ZipCodec};
use tidemark_core::document::document_from;
use tidemark_core::{DatabaseDumper, DocumentStore, MemoryDocumentStore};

const FILE_COUNT: usize = 16;
const PAYLOAD_SIZES: &[usize] = &[64 * 1024, 1024 * 1024, 8 * 1024 * 1024];
const DOCUMENT_COUNTS: &[usize] = &[1_000, 10_000];

/// Half random, half repetitive bytes spread over `FILE_COUNT` files
fn write_payload(dir: &Path, total: usize) {
    let mut rng = StdRng::seed_from_u64(42);
    let per_file = total / FILE_COUNT;
    for index in 0..FILE_COUNT {
        let mut contents = vec![b'n'; per_file];
        rng.fill(&mut contents[..per_file / 2]);
        std::fs::write(dir.join(format!("asset-{index}.bin")), contents).unwrap();
    }
}

fn bench_pack_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("archive");
    group.sample_size(20);

    for (label, codec) in [("fast", ZipCodec::fast()), ("default", ZipCodec::new())] {
        for &size in PAYLOAD_SIZES {
            let source = TempDir::new().unwrap();
            write_payload(source.path(), size);
            group.throughput(Throughput::Bytes(size as u64));

            group.bench_with_input(BenchmarkId::new(format!("pack/{label}"), size), &size, |b, _| {
                b.iter(|| {
                    let mut packed = Cursor::new(Vec::with_capacity(size));
                    codec.pack(black_box(source.path()), &mut packed).unwrap();
                    packed
                })
            });

            let mut packed = Cursor::new(Vec::new());
            codec.pack(source.path(), &mut packed).unwrap();
            let packed = packed.into_inner();

            group.bench_with_input(
                BenchmarkId::new(format!("unpack/{label}"), size),
                &size,
                |b, _| {
                    b.iter(|| {
                        let destination = TempDir::new().unwrap();
                        codec
                            .unpack(Cursor::new(black_box(&packed[..])), destination.path())
                            .unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_export(c: &mut Criterion) {
    let mut group = c.benchmark_group("dump");
    group.sample_size(20);

    for &count in DOCUMENT_COUNTS {
        let store = Arc::new(MemoryDocumentStore::new());
        let documents = (0..count)
            .map(|i| {
                document_from(json!({
                    "_id": i,
                    "title": format!("note {i}"),
                    "publicAt": "2024-05-01T12:00:00Z",
                    "tags": ["work", "draft"],
                }))
            })
            .collect();
        store.replace_collection("notes", documents).unwrap();
        let dumper = DatabaseDumper::new(Arc::clone(&store));

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("export", count), &count, |b, _| {
            b.iter(|| {
                let dir = TempDir::new().unwrap();
                dumper.export_to(&dir.path().join("dump")).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pack_unpack, bench_export);
criterion_main!(benches);
