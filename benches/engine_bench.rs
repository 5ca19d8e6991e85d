use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use varinject::model::{ElementSelection, StyleMap};
use varinject::{
    css, AgentCodeGenerator, EventType, Experiment, ExperimentStats, ExperimentStore, GenerateOptions,
    MemoryExperimentStore, Mode, StatsAggregator, Status, Variant,
};

fn variant(elements: usize) -> Variant {
    let mut styles = StyleMap::new();
    styles.insert("color".into(), "#c00".into());
    styles.insert("font-size".into(), "2rem".into());
    Variant {
        id: "V1".into(),
        name: "Bench".into(),
        is_control: false,
        elements: (0..elements)
            .map(|i| ElementSelection {
                id: format!("el-0-{}-0", i),
                selector: None,
                original_styles: StyleMap::new(),
                variant_styles: styles.clone(),
            })
            .collect(),
        traffic: 50.0,
        status: Status::Active,
    }
}

fn bench_generate(c: &mut Criterion) {
    let gen = AgentCodeGenerator::for_mode(Mode::Production);
    let opts = GenerateOptions {
        nonce: Some("bench".into()),
        ..Default::default()
    };
    let v = variant(50);

    c.bench_function("generate_canonical_agent", |b| {
        b.iter(|| gen.generate(black_box("E1"), &opts))
    });
    c.bench_function("generate_variant_agent_50_elements", |b| {
        b.iter(|| gen.generate_for_variant(black_box("E1"), &v, "https://shop.test/", &opts))
    });
}

fn bench_stats(c: &mut Criterion) {
    let store = Arc::new(MemoryExperimentStore::new());
    store.insert_experiment(Experiment {
        id: "E1".into(),
        name: "Bench".into(),
        target_url: "shop.test".into(),
        status: Status::Active,
        variants: vec![],
        results: ExperimentStats::default(),
    });
    let agg = StatsAggregator::new(store);
    let events = [
        EventType::ControlView,
        EventType::VariantView,
        EventType::VariantConversion,
        EventType::ControlConversion,
    ];

    c.bench_function("stats_apply_event", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            agg.apply("E1", &events[i % events.len()]).unwrap()
        })
    });
}

fn bench_css(c: &mut Criterion) {
    let sheet: String = (0..500)
        .map(|i| format!(".c{} {{ color: #{:03x}; margin: {}px }}\n@media (min-width: 600px) {{ .c{} {{ padding: 1px }} }}\n", i, i, i, i))
        .collect();
    c.bench_function("parse_stylesheet_1000_rules", |b| {
        b.iter(|| css::parse_stylesheet(black_box(&sheet)))
    });
}

criterion_group!(benches, bench_generate, bench_stats, bench_css);
criterion_main!(benches);
