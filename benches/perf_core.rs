use criterion::{black_box, criterion_group, criterion_main, Criterion};
use evoloop::categorize::{categorize, prioritize};
use evoloop::diagnostics::{observe, parse_output, RawDiagnostic};
use evoloop::diff;
use evoloop::learner::TemplateLibrary;
use evoloop::memory::{ContextLimits, ErrorMemory};
use evoloop::normalize::normalize;
use evoloop::store::Store;

const MESSAGES: &[&str] = &[
    "ea.mq5(120,14) : error 143: ';' - semicolon expected",
    "ea.mq5(88,3) : error 149: ')' - expected",
    "ea.mq5(12,9) : error 256: 'Ask' - undeclared identifier",
    "ea.mq5(40,1) : error 123: 'OnTick' - function not defined",
    "src/main.c:17:5: error: 'handle_42' undeclared (first use in this function)",
    "ea.mq5(300,22) : error 199: wrong parameters count",
];

fn synthetic_output(lines: usize) -> String {
    (0..lines)
        .map(|i| MESSAGES[i % MESSAGES.len()])
        .collect::<Vec<_>>()
        .join("\n")
}

fn synthetic_source(lines: usize, tweak: usize) -> String {
    (0..lines)
        .map(|i| {
            if tweak > 0 && i % tweak == 0 {
                format!("   double v{i} = iMA(Symbol(), 0, {i}, 0);")
            } else {
                format!("   int x{i} = {i};")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn bench_normalize_categorize(c: &mut Criterion) {
    c.bench_function("normalize_messages", |b| {
        b.iter(|| {
            for message in MESSAGES {
                black_box(normalize(black_box(message)));
            }
        });
    });

    let fingerprints: Vec<_> = MESSAGES.iter().map(|m| normalize(m)).collect();
    c.bench_function("categorize_fingerprints", |b| {
        b.iter(|| {
            for fingerprint in &fingerprints {
                black_box(categorize(fingerprint));
            }
        });
    });

    let batch: Vec<_> = fingerprints
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, fp)| (fp, i as u32 + 1))
        .collect();
    c.bench_function("prioritize_batch", |b| {
        b.iter(|| black_box(prioritize(batch.clone())));
    });
}

fn bench_memory(c: &mut Criterion) {
    let output = synthetic_output(400);
    let raw: Vec<RawDiagnostic> = parse_output(&output);
    let diagnostics = observe(&raw);
    let library = TemplateLibrary::default();
    let limits = ContextLimits {
        recurring_threshold: 2,
        top_k: 5,
        min_confidence: 0.6,
    };

    c.bench_function("memory_record_20_iterations", |b| {
        b.iter(|| {
            let mut memory = ErrorMemory::new();
            for iteration in 1..=20u32 {
                let keep = diagnostics.len() * (21 - iteration as usize) / 20;
                memory.record(iteration, &diagnostics[..keep]);
            }
            black_box(memory.learning_context(&library, limits));
        });
    });
}

fn bench_diff(c: &mut Criterion) {
    let before = synthetic_source(2_000, 0);
    let after = synthetic_source(2_000, 97);
    c.bench_function("diff_similarity_2000_lines", |b| {
        b.iter(|| black_box(diff::similarity(black_box(&before), black_box(&after))));
    });
    c.bench_function("diff_changed_regions_2000_lines", |b| {
        b.iter(|| black_box(diff::changed_regions(&before, &after)));
    });
}

fn bench_template_library_load(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Store::new(temp.path());
    store
        .update_templates(|_| {})
        .expect("save empty template library");

    c.bench_function("template_library_load", |b| {
        b.iter(|| {
            let library = store.load_templates().expect("load templates");
            black_box(library.len());
        });
    });
}

criterion_group!(
    perf_core,
    bench_normalize_categorize,
    bench_memory,
    bench_diff,
    bench_template_library_load
);
criterion_main!(perf_core);
