use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use sigvault::{
    generate_master_key, FieldEncryptionService, InMemoryDekStore, KeyStore, MissingHeaderPolicy,
    RequestSigner, SignatureConfig, SignatureVerifier, SignedRequest,
};

const SIZES: [(&str, usize); 3] = [("100B", 100), ("1KB", 1024), ("10KB", 10 * 1024)];

fn benchmark_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("signing");

    let store = Arc::new(KeyStore::new());
    store.register("bench-client", "bench-secret").unwrap();
    let mut config = SignatureConfig::new(MissingHeaderPolicy::Reject);
    config.replay.max_tracked_nonces = usize::MAX;
    let signer = RequestSigner::new(store.clone(), &config);
    let verifier = SignatureVerifier::new(store, &config).unwrap();
    let headers = [("x-api-version", "2"), ("content-type", "application/json")];

    for (name, size) in SIZES {
        let body = vec![b'a'; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("sign", name), &body, |b, body| {
            b.iter(|| {
                signer
                    .sign(
                        black_box("bench-client"),
                        black_box("POST"),
                        black_box("/api/notifications"),
                        black_box(&headers),
                        black_box(body),
                    )
                    .unwrap()
            });
        });

        // Each iteration needs a fresh nonce, so signing happens in setup.
        group.bench_with_input(BenchmarkId::new("verify", name), &body, |b, body| {
            b.iter_batched(
                || {
                    signer
                        .sign("bench-client", "POST", "/api/notifications", &headers, body)
                        .unwrap()
                },
                |env| {
                    let ok = verifier.verify(&SignedRequest {
                        key_id: env.key_id(),
                        signature: env.signature(),
                        timestamp: env.timestamp(),
                        nonce: env.nonce(),
                        method: "POST",
                        path: "/api/notifications",
                        headers: &headers,
                        body,
                    });
                    assert!(ok);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn benchmark_field_encryption(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_encryption");

    let svc = FieldEncryptionService::new(
        generate_master_key().unwrap(),
        Arc::new(InMemoryDekStore::new()),
        "default",
    )
    .unwrap();

    for (name, size) in SIZES {
        let plaintext = "x".repeat(size);
        let blob = svc.encrypt(&plaintext).unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", name), &plaintext, |b, p| {
            b.iter(|| svc.encrypt(black_box(p)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decrypt", name), &blob, |b, blob| {
            b.iter(|| svc.decrypt(black_box(blob)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_signing, benchmark_field_encryption);
criterion_main!(benches);
