use anyhow::Result;
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use swimclock::prelude::*;
use swimclock::{ENGINE_NAME, VERSION as LIB_VERSION};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

const LOGO_TEXT: &str = r"
   ____          _          _         _
  / __/_    __  (_)__ _    ____/ /__  ____/ /__
 _\ \ | |/|/ / / /  ' \  / __/ / _ \/ __/  '_/
/___/ |__,__/ /_/_/_/_/  \__/_/\___/\__/_/\_\
";

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct MyHighlighter;

impl Highlighter for MyHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            let colored_command = command.yellow().bold();
            let colored_rest = rest.yellow();
            Cow::Owned(format!("{} {}", colored_command, colored_rest))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", LOGO_TEXT.cyan());

    let version_string = format!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    println!("{}", "-".repeat(64).dimmed());

    let license_blurb = "
    This software is provided 'as is', without warranty of any kind.
    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.
    ";

    println!("{}", version_string);
    println!("{}", license_blurb.dimmed());
    println!("{}", "-".repeat(64).dimmed());
}

/// Spawns one task per stream the shell prints: runner reports and beat ticks.
fn spawn_event_listeners(engine: &SwimEngine, is_listening_to_ticks: Arc<AtomicBool>) {
    let mut reports = engine.scheduler().subscribe_reports();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            let line = match &report {
                RunnerEvent::Crashed { name, error } => {
                    format!("[{}] crashed: {}", name, error).red().to_string()
                }
                RunnerEvent::SavedFromCrash { name, state } => {
                    format!("[{}] saved from crash, back to {}", name, state)
                        .yellow()
                        .to_string()
                }
                other => format!("{:?}", other).dimmed().to_string(),
            };
            println!("\n<-- {}", line);
        }
    });

    // Tick listener (controlled by the shared flag)
    let mut ticks = engine.bus().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = ticks.recv().await {
            if let Event::Tick { beat, bar } = event {
                if is_listening_to_ticks.load(Ordering::Relaxed) {
                    println!("<-- [TICK] bar {} beat {}", bar, beat);
                }
            }
        }
    });
}

/// Parses `play` arguments: `key=value` pairs and an optional `@now`, `@beat` or `@bar`.
fn parse_play_args(words: &[&str]) -> std::result::Result<(Args, Option<Quant>), String> {
    let mut args = Args::new();
    let mut quant = None;
    for word in words {
        if let Some(target) = word.strip_prefix('@') {
            quant = Some(match target {
                "now" => Quant::Now,
                "beat" => Quant::NextBeat,
                "bar" => Quant::NextBar,
                other => match other.parse::<f64>() {
                    Ok(beats) => Quant::Beats(beats),
                    Err(_) => return Err(format!("unknown quantization '@{}'", other)),
                },
            });
        } else if let Some((key, value)) = word.split_once('=') {
            args.insert(key, Value::parse_literal(value));
        } else {
            return Err(format!("expected key=value, got '{}'", word));
        }
    }
    Ok((args, quant))
}

/// A function that logs its arguments every period until told otherwise.
fn printer(name: &str, output: Arc<dyn OutputSender>) -> SwimFn {
    SwimFn::new(name, move |ctx: SwimCtx| {
        let output = output.clone();
        async move {
            ctx.send(output.as_ref(), ctx.args())?;
            ctx.again(args! {})?;
            Ok(())
        }
    })
    .param("p", 1.0)
    .catch_all()
}

fn play(engine: &SwimEngine, output: &Arc<dyn OutputSender>, words: &[&str]) {
    let Some(name) = words.first() else {
        println!("Usage: play <NAME> [key=value ...] [@now|@beat|@bar|@<BEATS>]");
        return;
    };
    let (args, quant) = match parse_play_args(&words[1..]) {
        Ok(parsed) => parsed,
        Err(reason) => {
            println!("Error: {}.", reason);
            return;
        }
    };
    let func = printer(name, output.clone());
    let scheduled = match quant {
        Some(quant) => engine.scheduler().schedule_at(func, args, quant),
        None => engine.scheduler().schedule_func(func, args),
    };
    match scheduled {
        Ok(runner) => println!("--> Playing '{}' ({} state(s)).", runner.name(), runner.state_count()),
        Err(e) => println!("Error: {}", e),
    }
}

fn print_runners(engine: &SwimEngine) {
    let runners = engine.scheduler().runners();
    if runners.is_empty() {
        println!("No runners.");
        return;
    }
    println!("Runners:");
    for runner in runners {
        let args = runner
            .current_args()
            .map(|args| args.to_string())
            .unwrap_or_default();
        let background = if runner.is_background() { " (background)" } else { "" };
        println!(
            "  {:<12} iter {:<6} {}{}",
            runner.name().cyan(),
            runner.iter(),
            args,
            background.dimmed()
        );
    }
}

fn print_time(engine: &SwimEngine) {
    let clock = engine.clock();
    println!(
        "--> {:?} | {:.3}s | {} BPM | bar {} beat {} | {}/{}",
        clock.transport(),
        clock.time(),
        clock.tempo(),
        clock.bar(),
        clock.beat(),
        clock.beats_per_bar(),
        clock.source_name()
    );
}

fn print_help() {
    println!("Available commands:");
    println!("  play <N> [k=v ..] [@Q]  - Plays (or hot-swaps) function N. @Q is now, beat, bar or a beat count.");
    println!("  stop <N>                - Stops function N.");
    println!("  list                    - Shows every runner with its iteration and arguments.");
    println!("  panic                   - Stops every runner except background jobs.");
    println!("  tempo <BPM>             - Changes the tempo.");
    println!("  bpb <N>                 - Changes the beats per bar.");
    println!("  start | pause | resume  - Controls the transport.");
    println!("  time                    - Shows the transport position.");
    println!("  ticks on|off            - Prints every beat tick.");
    println!("  exit                    - Quits the shell.");
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::load(None)?;
    let engine = SwimEngine::new(config)?;
    let output: Arc<dyn OutputSender> = Arc::new(LogSender);

    let is_listening_to_ticks = Arc::new(AtomicBool::new(false));
    spawn_event_listeners(&engine, is_listening_to_ticks.clone());

    info!("Starting {}...", ENGINE_NAME.cyan());
    engine.start();

    let mut rl = Editor::new()?;
    rl.set_helper(Some(MyHighlighter));

    println!("{} is running. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let words = line.split_whitespace().collect::<Vec<_>>();
                let Some(command) = words.first() else {
                    continue;
                };
                match *command {
                    "play" => play(&engine, &output, &words[1..]),
                    "stop" => match words.get(1) {
                        Some(name) => {
                            if engine.scheduler().stop_runner(name, true) {
                                println!("--> Stopped '{}'.", name);
                            } else {
                                println!("--> No runner named '{}'.", name);
                            }
                        }
                        None => println!("Usage: stop <NAME>"),
                    },
                    "list" => print_runners(&engine),
                    "panic" => {
                        engine.scheduler().reset();
                        println!("--> Stopped every foreground runner.");
                    }
                    "tempo" => match words.get(1).map(|s| s.parse::<f64>()) {
                        Some(Ok(bpm)) => match engine.set_tempo(bpm) {
                            Ok(()) => println!("--> Tempo is now {} BPM.", bpm),
                            Err(e) => println!("Error: {}", e),
                        },
                        Some(Err(_)) => println!("Error: tempo must be a number."),
                        None => println!("--> Tempo is {} BPM.", engine.clock().tempo()),
                    },
                    "bpb" => match words.get(1).map(|s| s.parse::<u32>()) {
                        Some(Ok(beats)) => match engine.clock().set_beats_per_bar(beats) {
                            Ok(()) => println!("--> {} beats per bar.", beats),
                            Err(e) => println!("Error: {}", e),
                        },
                        Some(Err(_)) => println!("Error: beats per bar must be a whole number."),
                        None => println!("--> {} beats per bar.", engine.clock().beats_per_bar()),
                    },
                    "start" => engine.start(),
                    "pause" => engine.pause(),
                    "resume" => engine.resume(),
                    "time" => print_time(&engine),
                    "ticks" => match words.get(1) {
                        Some(&"on") => {
                            is_listening_to_ticks.store(true, Ordering::Relaxed);
                            println!("--> Started listening to beat ticks.");
                        }
                        Some(&"off") => {
                            is_listening_to_ticks.store(false, Ordering::Relaxed);
                            println!("--> Stopped listening to beat ticks.");
                        }
                        _ => println!("Usage: ticks on|off"),
                    },
                    "help" => print_help(),
                    "exit" => break,
                    _ => println!("Unknown command: '{}'. Type 'help'.", line),
                }
            }
            Err(_) => {
                println!("Exiting swimshell...");
                break;
            }
        }
    }

    engine.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_arguments_are_parsed() {
        let (args, quant) = parse_play_args(&["p=0.5", "note=c4", "@bar"]).unwrap();
        assert_eq!(args.f64("p"), Some(0.5));
        assert_eq!(args.str("note"), Some("c4"));
        assert_eq!(quant, Some(Quant::NextBar));

        let (_, quant) = parse_play_args(&["@2"]).unwrap();
        assert_eq!(quant, Some(Quant::Beats(2.0)));
        assert!(parse_play_args(&["oops"]).is_err());
        assert!(parse_play_args(&["@later"]).is_err());
    }
}
