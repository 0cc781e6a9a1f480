use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pad_core::{Commit, CommitBody, DocumentEngine, EditOp, OtTransform, TextTransform};

fn sample_text(approx_chars: usize) -> String {
    let pattern = "The quick brown fox jumps over the lazy dog. ";
    pattern.repeat(approx_chars / pattern.len() + 1)
}

fn commit(parent: usize, diff: Vec<EditOp>) -> Commit {
    Commit::from_body(&CommitBody::new(parent, diff)).unwrap()
}

fn bench_diff_small_edit(c: &mut Criterion) {
    let t = OtTransform::new();
    let base = sample_text(4_000);
    let mut target = base.clone();
    target.insert_str(2_000, "INSERTED ");

    c.bench_function("diff_4k_single_insert", |b| {
        b.iter(|| black_box(t.diff(black_box(&base), black_box(&target))))
    });
}

fn bench_diff_scattered_edits(c: &mut Criterion) {
    let t = OtTransform::new();
    let base = sample_text(1_000);
    let target = base.replace("fox", "cat");

    c.bench_function("diff_1k_scattered", |b| {
        b.iter(|| black_box(t.diff(black_box(&base), black_box(&target))))
    });
}

fn bench_rebase(c: &mut Criterion) {
    let t = OtTransform::new();
    let existing = commit(
        0,
        (0..50)
            .map(|i| EditOp::Insert { index: i * 20, val: "x".into() })
            .collect(),
    );
    let incoming = commit(
        0,
        (0..50)
            .map(|i| EditOp::Delete { index: i * 20 + 5, size: 3 })
            .collect(),
    );

    c.bench_function("rebase_50x50_ops", |b| {
        b.iter(|| black_box(t.rebase(black_box(&existing), black_box(&incoming)).unwrap()))
    });
}

fn bench_apply(c: &mut Criterion) {
    let t = OtTransform::new();
    let text = sample_text(10_000);
    let edit = commit(
        0,
        (0..100)
            .map(|i| EditOp::Insert { index: i * 90, val: "y".into() })
            .collect(),
    );

    c.bench_function("apply_100_ops_10k", |b| {
        b.iter(|| black_box(t.apply_diff(black_box(&text), black_box(&edit)).unwrap()))
    });
}

fn bench_submit_behind_head(c: &mut Criterion) {
    c.bench_function("submit_rebase_over_20", |b| {
        b.iter_batched(
            || {
                let engine = DocumentEngine::default();
                for i in 0..20 {
                    engine
                        .submit("bench", commit(i, vec![EditOp::Insert { index: 0, val: "a".into() }]), i as u64)
                        .unwrap();
                }
                engine
            },
            |engine| {
                black_box(
                    engine
                        .submit("bench", commit(0, vec![EditOp::Insert { index: 0, val: "b".into() }]), 99)
                        .unwrap(),
                )
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_diff_small_edit,
    bench_diff_scattered_edits,
    bench_rebase,
    bench_apply,
    bench_submit_behind_head,
);
criterion_main!(benches);
