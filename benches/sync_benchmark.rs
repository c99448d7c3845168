use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;

use driftsync::codec::{Decoder, Encoder};
use driftsync::{Awareness, AwarenessOrigin};

fn bench_var_uint_encode(c: &mut Criterion) {
    c.bench_function("var_uint_encode_mixed", |b| {
        b.iter(|| {
            let mut enc = Encoder::new();
            for v in [1u64, 127, 128, 16_384, u32::MAX as u64] {
                enc.write_var_uint(black_box(v));
            }
            black_box(enc.into_vec());
        })
    });
}

fn bench_var_uint_decode(c: &mut Criterion) {
    let mut enc = Encoder::new();
    for v in [1u64, 127, 128, 16_384, u32::MAX as u64] {
        enc.write_var_uint(v);
    }
    let buf = enc.into_vec();

    c.bench_function("var_uint_decode_mixed", |b| {
        b.iter(|| {
            let mut dec = Decoder::new(black_box(&buf));
            for _ in 0..5 {
                black_box(dec.read_var_uint().unwrap());
            }
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let mut awareness = Awareness::new(1);
    awareness.set_local_state(Some(json!({
        "name": "alice",
        "cursor": {"anchor": 120, "head": 128},
        "color": "#30bced",
    })));

    c.bench_function("awareness_encode_1_client", |b| {
        b.iter(|| black_box(awareness.encode_update(black_box(&[1])).unwrap()))
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    // 50 peers worth of presence in one blob
    let blob = {
        let mut enc = Encoder::new();
        enc.write_var_uint(50);
        for client in 100u64..150 {
            enc.write_var_uint(client);
            enc.write_var_uint(1);
            enc.write_var_string(r#"{"name":"peer","cursor":{"anchor":1,"head":2}}"#);
        }
        enc.into_vec()
    };

    c.bench_function("awareness_apply_50_clients", |b| {
        b.iter_batched(
            || Awareness::new(1),
            |mut awareness| {
                awareness
                    .apply_update(black_box(&blob), AwarenessOrigin::Remote)
                    .unwrap()
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_var_uint_encode,
    bench_var_uint_decode,
    bench_awareness_encode,
    bench_awareness_apply
);
criterion_main!(benches);
