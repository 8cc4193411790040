use criterion::{Criterion, criterion_group, criterion_main};
use plughost::{CompiledPlugin, Plugin, PluginOptions};
use std::hint::black_box;

const ECHO_WAT: &str = r#"
(module
  (import "env" "extism_input_offset" (func $input_offset (result i64)))
  (import "env" "extism_input_length" (func $input_length (result i64)))
  (import "env" "extism_output_set" (func $output_set (param i64 i64)))
  (func (export "echo") (result i32)
    (call $output_set (call $input_offset) (call $input_length))
    (i32.const 0))
)
"#;

fn bench_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("plugin_construction");

    group.bench_function("compile_and_instantiate", |b| {
        b.iter(|| {
            Plugin::new_with_options(black_box(ECHO_WAT), [], PluginOptions::default()).unwrap()
        })
    });

    let compiled = CompiledPlugin::from_bytes(ECHO_WAT, [], false).unwrap();
    group.bench_function("instantiate_precompiled", |b| b.iter(|| compiled.instantiate().unwrap()));

    group.finish();
}

fn bench_call(c: &mut Criterion) {
    let mut plugin = Plugin::new_with_options(ECHO_WAT, [], PluginOptions::default()).unwrap();
    let input = vec![b'x'; 1024];
    c.bench_function("echo_1kib", |b| b.iter(|| plugin.call("echo", black_box(&input)).unwrap()));
}

criterion_group!(benches, bench_construction, bench_call);
criterion_main!(benches);
