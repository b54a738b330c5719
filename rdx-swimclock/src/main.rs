use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use swimclock::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // 2. Load the configuration: an optional TOML path, then SWIMCLOCK__* variables.
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(path.as_deref())?;

    // 3. Create and start the engine.
    let engine = SwimEngine::new(config)?;
    spawn_report_listener(&engine);
    engine.start();

    // 4. Play a metronome now and a melody from the next bar.
    play_demo(&engine)?;

    info!(
        "{} v{} running at {} BPM. Press Ctrl+C to shut down.",
        swimclock::ENGINE_NAME,
        swimclock::VERSION,
        engine.clock().tempo()
    );
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received.");
    engine.stop();
    Ok(())
}

/// Logs every runner report.
fn spawn_report_listener(engine: &SwimEngine) {
    let mut reports = engine.scheduler().subscribe_reports();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            info!("[RUNNER] => {:?}", report);
        }
    });
}

fn play_demo(engine: &SwimEngine) -> Result<()> {
    let output: Arc<dyn OutputSender> = Arc::new(LogSender);

    let out = output.clone();
    let metronome = SwimFn::new("metronome", move |ctx: SwimCtx| {
        let out = out.clone();
        async move {
            let accent = ctx.clock().beat().rem_euclid(ctx.clock().beats_per_bar() as i64) == 0;
            let velocity = if accent { 110 } else { 70 };
            ctx.send(out.as_ref(), &args! { sound => "click", vel => velocity })?;
            ctx.again(args! {})?;
            Ok(())
        }
    })
    .param("p", 1.0);
    engine.scheduler().schedule_func(metronome, args! {})?;

    let out = output;
    let melody = SwimFn::new("melody", move |mut ctx: SwimCtx| {
        let out = out.clone();
        async move {
            let notes = ctx.get("notes").and_then(Value::as_str).unwrap_or("60").to_string();
            let note = ctx.pattern(&WordParser, &notes)?;
            ctx.send(out.as_ref(), &args! { note => note.clone() })?;
            ctx.sleep(0.25);
            ctx.send(out.as_ref(), &args! { note => note, vel => 40 })?;
            ctx.again(args! {})?;
            Ok(())
        }
    })
    .param("p", 0.5)
    .param("notes", "60 63 67 70");
    engine
        .scheduler()
        .schedule_at(melody, args! {}, Quant::NextBar)?;
    Ok(())
}
