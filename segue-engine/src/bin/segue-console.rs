//! Console playground: queue files from the command line and let the
//! engine crossfade through them.

use anyhow::{Context, Result};
use clap::Parser;
use segue_engine::{
    DeckId, Engine, EngineConfig, EngineEvent, VecTrackQueue,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "segue-console", about = "Crossfading console player")]
struct Args {
    /// Audio files to play, in order.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Output device name (default device if omitted).
    #[arg(long)]
    device: Option<String>,

    /// Fading curve, 0..=100.
    #[arg(long)]
    fading_curve: Option<f64>,

    /// Optional JSON engine config file; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segue_engine=info,segue_console=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config: EngineConfig = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if args.device.is_some() {
        config.device = args.device.clone();
    }
    if let Some(curve) = args.fading_curve {
        config.fading_curve = curve;
    }

    let track_count = args.files.len();
    let mut queue = VecTrackQueue::new();
    for file in &args.files {
        queue.push_path(file.clone());
    }

    let engine = Engine::new(Box::new(queue), config).context("starting engine")?;

    let finished = Arc::new(AtomicUsize::new(0));
    let finished_in_listener = Arc::clone(&finished);
    engine.add_listener(Arc::new(move |event: &EngineEvent| match event {
        EngineEvent::Loaded { deck } => println!("[{deck}] loaded"),
        EngineEvent::Started { deck } => println!("[{deck}] started"),
        EngineEvent::Finished { deck } => {
            println!("[{deck}] finished");
            finished_in_listener.fetch_add(1, Ordering::SeqCst);
        }
        EngineEvent::PreCueNext => println!("(cueing next track)"),
        _ => {}
    }));

    engine.play();

    while finished.load(Ordering::SeqCst) < track_count {
        std::thread::sleep(Duration::from_millis(500));
        if let Some(snapshot) = engine
            .deck_snapshot(DeckId::A)
            .into_iter()
            .chain(engine.deck_snapshot(DeckId::B))
            .find(|s| s.main)
        {
            print!(
                "\r{:<40} {:6.1}s / {:6.1}s  L{:4.2} R{:4.2}   ",
                snapshot
                    .track_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                snapshot.position,
                snapshot.duration,
                engine.get_level(0),
                engine.get_level(1),
            );
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
    }

    println!("\nall tracks finished");
    Ok(())
}
