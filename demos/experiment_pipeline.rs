//! Experiment Pipeline Example
//!
//! Schedules a three-step measurement pipeline, runs it against a disk
//! store in a temporary directory, then queries the stored results.
//!
//! Run with: cargo run --example experiment_pipeline

use protos_db::experiment::Builder;
use protos_db::protocol::ProtocolRegistry;
use protos_db::query::{exact_experiment, search_experiments};
use protos_db::storage;
use protos_db::token::Args;
use protos_db::{logging, Bundle, Config};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    logging::init("info")?;
    println!("=== Protos-DB Experiment Pipeline ===\n");

    let data = tempfile::tempdir()?;
    let config = Config::default()
        .with_storage("disk")
        .with_project_name("optics")
        .with_data_dir(data.path());

    // -------------------------------------------------------------------------
    // 1. Register protocols
    // -------------------------------------------------------------------------
    println!("1. Registering protocols...");

    let mut protocols = ProtocolRegistry::new();
    protocols.register("optics.dark_frame", |ctx, inputs| {
        let exposure = inputs.value("exposure").and_then(|v| v.as_f64()).unwrap_or(1.0);
        Ok(Bundle::create(ctx, "dark_frame").with_data("level", 0.02 * exposure))
    })?;
    protocols.register("optics.measure", |ctx, _| {
        Ok(Bundle::create(ctx, "raw").with_data("counts", json!([104.0, 98.5, 101.2])))
    })?;
    protocols.register("optics.reduce", |ctx, inputs| {
        let dark = inputs
            .bundle(0)
            .and_then(|b| b.data().get("level"))
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        let counts: Vec<f64> = inputs
            .bundle(1)
            .and_then(|b| b.data().get("counts"))
            .and_then(serde_json::Value::as_array)
            .map(|values| values.iter().filter_map(serde_json::Value::as_f64).collect())
            .unwrap_or_default();
        #[allow(clippy::cast_precision_loss)]
        let mean = counts.iter().sum::<f64>() / counts.len().max(1) as f64;
        Ok(Bundle::create(ctx, "reduced").with_data("mean", mean - dark))
    })?;
    for name in protocols.names() {
        println!("   {name}");
    }

    // -------------------------------------------------------------------------
    // 2. Define the experiment (nothing runs yet)
    // -------------------------------------------------------------------------
    println!("\n2. Defining experiment...");

    let optics = protocols.namespace("optics");
    let experiment = Builder::from_config("nightly-scan", &config).define(|b| {
        b.tag("demo");
        let dark = b.schedule(optics.get("dark_frame")?, Args::new().kwarg("exposure", 2.0));
        let raw = b.schedule(optics.get("measure")?, Args::new());
        b.schedule(optics.get("reduce")?, Args::new().arg(dark).arg(raw));
        Ok::<_, protos_db::Error>(())
    })?;
    println!("   {} steps scheduled", experiment.len());

    // -------------------------------------------------------------------------
    // 3. Run it
    // -------------------------------------------------------------------------
    println!("\n3. Running...");

    let mut store = storage::open(&config)?;
    let run = experiment.run(store.as_mut())?;
    println!("   Experiment ID: {}", run.xid());
    println!("   Progress: {}%", run.metadata().progress);

    // -------------------------------------------------------------------------
    // 4. Query stored results
    // -------------------------------------------------------------------------
    println!("\n4. Querying...");

    let tagged = search_experiments(store.as_mut(), &json!({"metadata": {"tags": ["demo"]}}))?;
    println!("   Experiments tagged 'demo': {}", tagged.len());

    if let Some(handle) = exact_experiment(store.as_mut(), run.xid())? {
        let reduced = json!({"metadata": {"bundle_type": "reduced"}});
        for bundle in handle.search_bundles(store.as_mut(), &reduced)? {
            println!("   {} -> mean {}", bundle.id(), bundle.data()["mean"]);
        }
    }
    println!("   Stored under {}", store.name());

    println!("\n=== Done ===");
    Ok(())
}
