use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use tether::args::{arg, arg_splat, receiver};
use tether::{from_handle, into_handle, Builtin, Class, Handle, Module};
use tether_sandbox::Sandbox;

fn bench_add(c: &mut Criterion) {
    let sandbox = Sandbox::new();
    let _attached = sandbox.attach().unwrap();
    Class::builtin(Builtin::Integer)
        .unwrap()
        .define_method("add", (receiver::<i64>(), arg::<i64>("n")), |(this, n)| this + n)
        .unwrap();

    let mut group = c.benchmark_group("add");
    let five = sandbox.int(5);
    let three = sandbox.int(3);

    group.bench_function("builtin", |b| {
        b.iter(|| sandbox.call(black_box(five), "+", &[black_box(three)]));
    });

    group.bench_function("native", |b| {
        b.iter(|| sandbox.call(black_box(five), "add", &[black_box(three)]));
    });

    group.finish();
}

fn bench_splat(c: &mut Criterion) {
    let sandbox = Sandbox::new();
    let _attached = sandbox.attach().unwrap();
    Module::object()
        .unwrap()
        .define_method("sum", (arg_splat::<i64>(),), |(values,)| values.iter().sum::<i64>())
        .unwrap();

    let mut group = c.benchmark_group("splat");
    for count in [1_usize, 8, 64] {
        let args: Vec<Handle> = (0..count as i64).map(|n| sandbox.int(n)).collect();
        group.bench_with_input(BenchmarkId::new("sum", count), &args, |b, args| {
            b.iter(|| sandbox.call(Handle::NIL, "sum", black_box(args)));
        });
    }
    group.finish();
}

fn bench_conversion(c: &mut Criterion) {
    let sandbox = Sandbox::new();
    let _attached = sandbox.attach().unwrap();

    // Conversions allocate; collecting in the untimed setup keeps the heap flat.
    c.bench_function("string_round_trip", |b| {
        b.iter_batched(
            || sandbox.gc_start(),
            |_| {
                let handle = into_handle(black_box("tether")).unwrap();
                from_handle::<String>(handle).unwrap()
            },
            BatchSize::SmallInput,
        );
    });

    let values: Vec<i64> = (0..32).collect();
    c.bench_function("vec_round_trip", |b| {
        b.iter_batched(
            || {
                sandbox.gc_start();
                values.clone()
            },
            |values| {
                let handle = into_handle(black_box(values)).unwrap();
                from_handle::<Vec<i64>>(handle).unwrap()
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_add, bench_splat, bench_conversion);
criterion_main!(benches);
