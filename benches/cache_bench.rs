use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use tiered_cache::cache::{CompressionCodec, CompressionConfig, MemoryCache, MemoryConfig};
use tiered_cache::{CacheConfig, CompressionEncoding, TieredCache};

fn payload(items: usize) -> String {
    let rows: Vec<_> = (0..items)
        .map(|i| serde_json::json!({ "id": i, "sku": format!("SKU-{:06}", i), "price": i as f64 * 1.25 }))
        .collect();
    serde_json::to_string(&rows).unwrap_or_default()
}

fn codec(encoding: CompressionEncoding) -> CompressionCodec {
    CompressionCodec::new(CompressionConfig {
        enabled: true,
        min_size_bytes: 256,
        encoding,
        brotli_quality: 5,
        gzip_level: 6,
    })
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for items in [50, 500] {
        let json = payload(items);
        for encoding in [CompressionEncoding::Brotli, CompressionEncoding::Gzip] {
            let codec = codec(encoding);
            let wire = codec.encode(json.clone());

            group.bench_with_input(
                BenchmarkId::new(format!("encode_{}", encoding), items),
                &json,
                |b, json| b.iter(|| black_box(codec.encode(json.clone()))),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("decode_{}", encoding), items),
                &wire,
                |b, wire| b.iter(|| black_box(codec.decompress(wire))),
            );
        }
    }

    group.finish();
}

fn bench_memory_tier(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let memory: MemoryCache<serde_json::Value> = MemoryCache::new(&MemoryConfig {
        max_entries: 1_000,
        ..Default::default()
    });

    runtime.block_on(async {
        for i in 0..1_000 {
            memory.set(&format!("key-{}", i), serde_json::json!(i), 300).await;
        }
    });

    c.bench_function("memory_get_hit", |b| {
        let memory = &memory;
        b.to_async(&runtime)
            .iter(move || async move { black_box(memory.get("key-500").await) })
    });

    // steady state: every insert evicts the oldest entry
    let mut next = 1_000u64;
    c.bench_function("memory_set_with_eviction", |b| {
        b.to_async(&runtime).iter(|| {
            next += 1;
            let key = format!("key-{}", next);
            let value = serde_json::json!(next);
            let memory = &memory;
            async move { memory.set(&key, value, 300).await }
        })
    });
}

fn bench_remember_hit(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let cache = runtime.block_on(async {
        let cache = TieredCache::new(CacheConfig::default()).unwrap();
        cache.set("hot", &payload(10), 300).await.unwrap();
        cache
    });

    c.bench_function("remember_hit_memory_only", |b| {
        let cache = &cache;
        b.to_async(&runtime).iter(move || async move {
            let value: String = cache
                .remember("hot", 300, || async { Ok(String::new()) })
                .await
                .unwrap();
            black_box(value)
        })
    });
}

criterion_group!(benches, bench_codec, bench_memory_tier, bench_remember_hit);
criterion_main!(benches);
