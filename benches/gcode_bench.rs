// Benchmark for line parsing and macro expansion
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use krusty_loader::dispatch::Dispatcher;
use krusty_loader::file_manager::FileManager;
use krusty_loader::gcode::parse_line;
use krusty_loader::macros::{HandlebarsEngine, MacroDefinition};
use krusty_loader::MacroExpander;
use std::sync::Arc;

fn bench_parse_line(c: &mut Criterion) {
    let lines: Vec<String> = (0..10_000)
        .map(|i| format!("G1 X{} Y{} F1500 ; move {}", i, i, i))
        .collect();
    c.bench_function("parse 10k G1 lines", |b| {
        b.iter(|| {
            let count = lines.iter().filter_map(|l| parse_line(l)).count();
            assert_eq!(count, 10_000);
        });
    });
}

fn bench_macro_expansion(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = Dispatcher::new(FileManager::new("."), Arc::new(HandlebarsEngine::new()));
    let body = (0..1000)
        .map(|i| format!("G1 X{} Y{} F{{{{params.F}}}}", i, i))
        .collect::<Vec<_>>()
        .join("\n");
    rt.block_on(async {
        dispatcher
            .load_macro(MacroDefinition::new("BIGMACRO", &body).unwrap())
            .await
            .unwrap();
    });
    c.bench_function("expand BIGMACRO (1000 lines)", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut expander = MacroExpander::for_script("BIGMACRO F1500", Arc::clone(&dispatcher));
                let mut count = 0;
                while let Some(_line) = expander.next_line().await.unwrap() {
                    count += 1;
                }
                assert_eq!(count, 1000);
            });
        });
    });
}

criterion_group!(benches, bench_parse_line, bench_macro_expansion);
criterion_main!(benches);
