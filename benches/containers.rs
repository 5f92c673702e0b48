use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use qforest_ml_stack::{OAMap, PackedVec};

fn packed_vec_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("packed_vec");
    for bits in [2u8, 4, 7, 8, 16] {
        let mut v = PackedVec::new(bits);
        v.resize(4096, 0).unwrap();
        for i in 0..4096 {
            v.set(i, i as u64);
        }
        group.bench_function(BenchmarkId::new("get", bits), |b| {
            b.iter(|| {
                let mut sum = 0u64;
                for i in 0..4096 {
                    sum = sum.wrapping_add(v.get(black_box(i)));
                }
                sum
            })
        });
    }
    group.bench_function("fill_4bit", |b| {
        let mut v = PackedVec::new(4);
        v.resize(4096, 0).unwrap();
        b.iter(|| v.fill(black_box(0b1010)))
    });
    group.finish();
}

fn oa_map_inserts(c: &mut Criterion) {
    c.bench_function("oa_map_insert_1k", |b| {
        b.iter(|| {
            let mut map = OAMap::new();
            for key in 0u32..1000 {
                map.insert(black_box(key), key).unwrap();
            }
            map.len()
        })
    });
}

criterion_group!(benches, packed_vec_access, oa_map_inserts);
criterion_main!(benches);
