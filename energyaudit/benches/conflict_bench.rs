use criterion::{black_box, criterion_group, criterion_main, Criterion};
use energyaudit::conflict::{CircuitComparison, ConflictDetector, ConflictThresholds, SideSnapshot};
use energyaudit::prelude::*;
use energyaudit::{MemoryStore, VoltageDropInputs, VoltageDropResult};
use std::sync::Arc;

const PANELS: usize = 20;
const LOADS_PER_PANEL: usize = 50;

fn comparisons() -> Vec<CircuitComparison> {
    (0..PANELS * LOADS_PER_PANEL)
        .map(|i| {
            let drift = (i % 7) as f64 * 0.4;
            CircuitComparison {
                circuit_id: format!("vd-run-{}", i),
                counterpart_id: format!("P-{}-L{}", i / LOADS_PER_PANEL, i % LOADS_PER_PANEL),
                name: format!("Run {}", i),
                voltage_drop: SideSnapshot {
                    voltage_drop_percent: Some(1.5 + drift),
                    conductor_length: Some(20.0 + drift * 3.0),
                    is_compliant: Some(1.5 + drift <= 3.0),
                    timestamp: 200,
                },
                schedule_of_loads: SideSnapshot {
                    voltage_drop_percent: Some(1.5),
                    conductor_length: Some(20.0),
                    is_compliant: Some(true),
                    timestamp: 100,
                },
            }
        })
        .collect()
}

fn panels() -> Vec<LoadSchedule> {
    (0..PANELS)
        .map(|p| {
            let mut schedule = LoadSchedule::new(format!("P-{}", p), format!("Panel {}", p), 230.0, 0.9)
                .with_feeder("2 AWG", 40.0);
            for l in 0..LOADS_PER_PANEL {
                schedule = schedule.with_load(
                    LoadItem::new(format!("L{}", l), "Lighting", 4, 100.0).with_conductor("12 AWG", 20.0 + l as f64),
                );
            }
            schedule
        })
        .collect()
}

fn linked_record(p: usize, l: usize) -> VoltageDropRecord {
    let inputs = VoltageDropInputs {
        system_voltage: 230.0,
        current: 1.93,
        conductor_length: 20.0 + l as f64,
        conductor_size: "12 AWG".to_string(),
        conductor_material: Default::default(),
        conduit_material: None,
        phase_configuration: Default::default(),
        power_factor: 0.9,
        temperature: None,
        circuit_type: Default::default(),
    };
    VoltageDropRecord::new(format!("run-{}-{}", p, l), "Run", inputs)
        .linked_to(format!("P-{}-L{}", p, l))
        .with_results(VoltageDropResult {
            voltage_drop_percent: 2.0 + (l % 5) as f64 * 0.3,
            voltage_drop: 4.6,
            receiving_end_voltage: 225.4,
            is_compliant: true,
            max_allowed_drop_percent: 3.0,
        })
}

fn bench_detect_conflicts(c: &mut Criterion) {
    let detector = ConflictDetector::new(ConflictThresholds::default());
    let comparisons = comparisons();

    c.bench_function("detect_conflicts_1000", |b| {
        b.iter(|| detector.detect(black_box(&comparisons)));
    });
}

fn bench_sync_pass(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = rt.block_on(async {
        let engine = SyncEngine::new(SyncConfig::default(), Arc::new(MemoryStore::new()));
        for schedule in panels() {
            engine.update_load_schedule(schedule).await.unwrap();
        }
        for p in 0..PANELS {
            for l in (0..LOADS_PER_PANEL).step_by(2) {
                engine.update_voltage_drop_record(linked_record(p, l)).await.unwrap();
            }
        }
        engine
    });

    c.bench_function("sync_pass_1500_circuits", |b| {
        b.to_async(&rt).iter(|| engine.sync_now(black_box(false)));
    });
}

criterion_group!(benches, bench_detect_conflicts, bench_sync_pass);
criterion_main!(benches);
