use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use isp_aic::kernel::{KernelDescriptor, Section, TerminalType};
use isp_aic::{
    AicContext, Collaborators, ContextSizing, GroupConfig, ResultBundle, ResultCache,
    TerminalMemory, TuningDefaults,
};

fn cold_start() -> ResultBundle {
    TuningDefaults::default().cold_start_bundle()
}

fn benchmark_cache_save(c: &mut Criterion) {
    let bundle = ResultBundle::defaults();
    let mut group = c.benchmark_group("result_cache_save");
    for capacity in [5usize, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &n| {
            let cache = ResultCache::new(n, cold_start());
            let mut frame = 0u64;
            b.iter(|| {
                cache.save(frame, black_box(&bundle));
                frame += 1;
            });
        });
    }
    group.finish();
}

fn benchmark_cache_assign(c: &mut Criterion) {
    let cache = ResultCache::new(5, cold_start());
    let bundle = ResultBundle::defaults();
    c.bench_function("result_cache_assign", |b| {
        b.iter_batched(
            || bundle.clone(),
            |shared| cache.assign(7, shared),
            BatchSize::SmallInput,
        );
    });
}

fn benchmark_cache_query(c: &mut Criterion) {
    let cache = ResultCache::new(5, cold_start());
    for frame in 0..5 {
        cache.save(frame, &ResultBundle::defaults());
    }

    c.bench_function("result_cache_query_hit", |b| {
        b.iter(|| black_box(cache.query(black_box(3))));
    });
    c.bench_function("result_cache_query_miss", |b| {
        b.iter(|| black_box(cache.query(black_box(1_000))));
    });
    c.bench_function("result_cache_query_complete", |b| {
        b.iter(|| black_box(cache.query_complete(black_box(3))));
    });
}

fn benchmark_run_kernels(c: &mut Criterion) {
    let mut config = GroupConfig::new(0, 1);
    for i in 0..32u32 {
        config = config
            .kernel(KernelDescriptor::new(i))
            .offset(i, TerminalType::ParamIn, 0, 0, vec![Section::new(i * 128, 128)]);
    }

    let mut ctx = AicContext::new(
        0,
        ContextSizing::default(),
        &TuningDefaults::default(),
        Collaborators::default(),
    )
    .unwrap();
    ctx.configure(&config).unwrap();
    ctx.register_buffer(0, 0, 0, TerminalMemory::zeroed(32 * 128), 32 * 128)
        .unwrap();
    ctx.save_results(1, &ResultBundle::defaults());

    c.bench_function("run_kernels_32", |b| {
        b.iter(|| black_box(ctx.run_kernels(0, 1, 0).unwrap()));
    });
}

criterion_group!(
    benches,
    benchmark_cache_save,
    benchmark_cache_assign,
    benchmark_cache_query,
    benchmark_run_kernels
);
criterion_main!(benches);
