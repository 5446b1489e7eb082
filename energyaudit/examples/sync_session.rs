//! Sync session example: load saved calculations, report conflicts and
//! settle them with the newest-wins merge.

use energyaudit::prelude::*;
use energyaudit::{import_calculations, CalculationKind, MemoryStore};
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), EnergyAuditError> {
    let mut args = std::env::args().skip(1);
    let schedules = args
        .next()
        .unwrap_or_else(|| "tests/fixtures/schedules.json".to_string());
    let voltage_drop = args
        .next()
        .unwrap_or_else(|| "tests/fixtures/voltage_drop.json".to_string());

    for path in [&schedules, &voltage_drop] {
        if !Path::new(path).exists() {
            eprintln!("File not found: {}", path);
            eprintln!("Usage: cargo run --example sync_session [schedules.json] [voltage_drop.json]");
            std::process::exit(1);
        }
    }

    let store = Arc::new(MemoryStore::new());
    import_calculations(store.as_ref(), CalculationKind::ScheduleOfLoads, Path::new(&schedules)).await?;
    import_calculations(store.as_ref(), CalculationKind::VoltageDrop, Path::new(&voltage_drop)).await?;

    let session = AuditSession::new(SyncConfig::default(), store);
    let report = session.sync(true).await;

    println!("Circuits processed: {}", report.outcome.circuits_processed);
    println!("Conflicts detected: {}", report.outcome.conflicts_detected);
    println!();

    let open: Vec<Conflict> = report.unresolved().cloned().collect();
    for conflict in &open {
        println!(
            "  [{}] {} vs {}: {} ({:.2}{} vs {:.2}{})",
            conflict.severity,
            conflict.circuit_id,
            conflict.counterpart_id,
            conflict.conflict_type,
            conflict.voltage_drop_source.value,
            conflict.conflict_type.unit(),
            conflict.schedule_of_loads_source.value,
            conflict.conflict_type.unit(),
        );
    }

    let ids: Vec<String> = open.iter().map(|c| c.id.clone()).collect();
    let batch = session.engine().resolve_conflicts(&ids, ResolutionStrategy::Merge).await;
    println!();
    println!("Resolved {}, failed {}", batch.success_count(), batch.failure_count());

    let report = session.sync(false).await;
    if report.has_severity_at_least(ConflictSeverity::Low) {
        println!("Conflicts remain after merge.");
        std::process::exit(1);
    }
    println!("Calculators are in sync.");
    Ok(())
}
