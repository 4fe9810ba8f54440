//! Patch VM CLI - run scenes against the local environment
//!
//! Provides subcommands for running a scene file, checking that its
//! scripts compile, writing a default config, and serving the local
//! environment over stdio for an out-of-process host.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use patchvm::runtime::channel::serve_lines;
use patchvm::runtime::environment::LocalEnvironment;
use patchvm::runtime::events::RuntimeEvent;
use patchvm::{Runtime, RuntimeConfig, Script, Sprite, Target};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "patchvm")]
#[command(about = "Cooperative scheduler for sprite scripts", long_about = None)]
struct Cli {
    /// Runtime config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scene: green flag, optional key presses and broadcasts, then wait
    Run {
        /// Scene file (JSON)
        scene: PathBuf,

        /// Keys to press after the green flag
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,

        /// Broadcasts to send after the green flag
        #[arg(long, value_delimiter = ',')]
        broadcast: Vec<String>,
    },

    /// Check that every script in a scene compiles
    Check {
        /// Scene file (JSON)
        scene: PathBuf,
    },

    /// Write a default config file
    InitConfig {
        /// Destination path
        path: PathBuf,
    },

    /// Serve the local environment as NDJSON over stdin/stdout
    Serve,
}

#[derive(Deserialize)]
struct Scene {
    #[serde(default)]
    stage: Option<SceneSprite>,
    #[serde(default)]
    sprites: Vec<SceneSprite>,
}

#[derive(Deserialize)]
struct SceneSprite {
    name: String,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    scripts: Vec<SceneScript>,
}

#[derive(Deserialize)]
struct SceneScript {
    hat: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
    body: Value,
}

impl SceneSprite {
    fn into_sprite(self) -> (Sprite, f64, f64) {
        let mut sprite = Sprite::new(self.name);
        for script in self.scripts {
            let mut built = Script::new(script.hat, script.body.to_string());
            built.fields = script.fields;
            sprite = sprite.with_script(built);
        }
        (sprite, self.x, self.y)
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn load_scene(runtime: &Runtime, path: &Path) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let scene: Scene = serde_json::from_str(&contents).context("parsing scene")?;

    if let Some(stage) = scene.stage {
        let (sprite, _, _) = stage.into_sprite();
        runtime.add_target(Arc::new(Target::new_stage(Arc::new(sprite))));
    }
    for entry in scene.sprites {
        let (sprite, x, y) = entry.into_sprite();
        let target = Arc::new(Target::new(Arc::new(sprite)));
        target.with_state(|state| {
            state.x = x;
            state.y = y;
        });
        runtime.add_target(target);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `serve` keeps stdout for the protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            scene,
            keys,
            broadcast,
        } => {
            let runtime = Runtime::with_local_environment(config);
            load_scene(&runtime, &scene)?;
            runtime.load().await?;
            runtime.start();

            let mut events = runtime.subscribe();
            let mut started = runtime.green_flag();
            for key in &keys {
                started.extend(runtime.key_pressed(key));
            }
            for name in &broadcast {
                started.extend(runtime.broadcast(name));
            }
            println!("Started {} threads", started.len());

            runtime.wait_until_idle().await?;

            let mut finished = 0;
            while let Ok(event) = events.try_recv() {
                if matches!(event, RuntimeEvent::ThreadFinished { .. }) {
                    finished += 1;
                }
            }
            println!("Finished {} runs", finished);

            for target in runtime.targets() {
                let state = target.state();
                let kind = if target.is_stage() {
                    "stage"
                } else if target.is_original() {
                    "sprite"
                } else {
                    "clone"
                };
                println!(
                    "  {:<6} {:<16} x={:.2} y={:.2} direction={:.1}",
                    kind,
                    target.name(),
                    state.x,
                    state.y,
                    state.direction
                );
            }

            let faults = runtime.script_faults();
            if !faults.is_empty() {
                println!("Faults:");
                for fault in faults {
                    println!(
                        "  {} at {:?}: {}",
                        fault.thread, fault.position, fault.message
                    );
                }
            }
            runtime.quit();
        }

        Commands::Check { scene } => {
            let runtime = Runtime::with_local_environment(config);
            load_scene(&runtime, &scene)?;
            runtime.load().await?;
            println!("{} targets, all scripts compile", runtime.target_count());
            runtime.quit();
        }

        Commands::InitConfig { path } => {
            RuntimeConfig::default()
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote default config to {:?}", path);
        }

        Commands::Serve => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let env = serve_lines(stdin, tokio::io::stdout());
            LocalEnvironment::new(env).run().await;
        }
    }

    Ok(())
}
