use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use switchboard::features::{FeatureSet, HookAction, HookRemove, IntervalAction};

fn feature_set() -> FeatureSet {
    let mut features = FeatureSet::new();
    for code in [
        "*1", "*2", "*21", "*672", "*98", "*99", "#0", "70", "71", "720",
    ] {
        features.dtmf_hook(code, HookRemove::empty(), Box::new(|_| HookAction::Keep));
    }
    features
}

pub fn dtmf_search(c: &mut Criterion) {
    let features = feature_set();

    c.bench_function("dtmf prefix search", |b| {
        b.iter(|| {
            black_box(features.dtmf_search(black_box("*2")));
            black_box(features.dtmf_search(black_box("*6")));
            black_box(features.dtmf_search(black_box("9")));
        })
    });
}

pub fn interval_churn(c: &mut Criterion) {
    c.bench_function("interval install + drain", |b| {
        b.iter(|| {
            let mut features = FeatureSet::new();
            for i in 1..=16u64 {
                features.interval_hook(
                    Duration::from_millis(i * 10),
                    false,
                    HookRemove::empty(),
                    Box::new(|_| IntervalAction::Keep),
                );
            }
            black_box(features.interval_hook_count());
        })
    });
}

criterion_group!(benches, dtmf_search, interval_churn);
criterion_main!(benches);
