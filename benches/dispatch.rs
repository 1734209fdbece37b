use alcommon::{Broker, Module, Value};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn broker() -> Broker {
    let broker = Broker::local("bench").unwrap();
    let module = Module::new("Math");
    module.method("add").bind(|a: i32, b: i32| a + b).unwrap();
    broker.register_module(module).unwrap();
    broker
}

fn bench_native_call(c: &mut Criterion) {
    let broker = broker();
    let proxy = broker.proxy("Math").unwrap();
    c.bench_function("call_native", |b| {
        b.iter(|| proxy.call::<i32, _>("add", black_box((1, 2))).unwrap())
    });
}

fn bench_marshalled_call(c: &mut Criterion) {
    let broker = broker();
    let proxy = broker.proxy("Math").unwrap();
    let params = Value::from_slice(&[1, 2]);
    c.bench_function("call_value", |b| {
        b.iter(|| proxy.call_value("add", black_box(params.clone())).unwrap())
    });
}

fn bench_pcall_wait(c: &mut Criterion) {
    let broker = broker();
    let proxy = broker.proxy("Math").unwrap();
    c.bench_function("pcall_wait", |b| {
        b.iter(|| {
            let task = proxy.pcall("add", (1, 2)).unwrap();
            proxy.wait(task, 0).unwrap()
        })
    });
}

criterion_group!(benches, bench_native_call, bench_marshalled_call, bench_pcall_wait);
criterion_main!(benches);
