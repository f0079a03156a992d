//! REPL driving a simulated panel

use anyhow::{bail, Context, Result};
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;

use patch_surface::config::AppConfig;
use patch_surface::control_loop::LoopStatus;
use patch_surface::hardware::SimPanel;
use patch_surface::panel::{KnobReader, MODES};

const TAP_MS: u64 = 100;
const DEFAULT_HOLD_MS: u64 = 1500;

#[derive(Debug, Clone, PartialEq)]
enum Command {
    /// Short press
    Press(usize),
    Hold(usize, u64),
    Knob(usize, f32),
    Leds,
    Patch,
    Help,
    Quit,
}

/// Resolve a button number or a jack name
fn button_arg(config: &AppConfig, arg: Option<&str>) -> Result<usize> {
    let arg = arg.context("missing button")?;
    if let Ok(button) = arg.parse() {
        return Ok(button);
    }
    config
        .panel
        .jacks
        .iter()
        .find(|j| j.name.eq_ignore_ascii_case(arg))
        .map(|j| j.button)
        .with_context(|| format!("no button or jack named '{}'", arg))
}

fn parse_command(config: &AppConfig, line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        bail!("empty command");
    };

    let command = match verb {
        "press" | "p" => Command::Press(button_arg(config, words.next())?),
        "hold" | "h" => {
            let button = button_arg(config, words.next())?;
            let ms = match words.next() {
                Some(ms) => ms.parse().with_context(|| format!("bad duration '{}'", ms))?,
                None => DEFAULT_HOLD_MS,
            };
            Command::Hold(button, ms)
        }
        "knob" | "k" => {
            let knob = words
                .next()
                .context("missing knob")?
                .parse()
                .context("bad knob number")?;
            let value: f32 = words
                .next()
                .context("missing value")?
                .parse()
                .context("bad knob value")?;
            if !(0.0..=1.0).contains(&value) {
                bail!("knob value must be within 0..1");
            }
            Command::Knob(knob, value)
        }
        "leds" | "l" => Command::Leds,
        "patch" | "status" => Command::Patch,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => bail!("unknown command '{}'", other),
    };
    Ok(command)
}

fn print_help() {
    println!("  {}  short press (button number or jack name)", "press <b>".bright_white());
    println!("  {}  hold for ms (default {})", "hold <b> [ms]".bright_white(), DEFAULT_HOLD_MS);
    println!("  {}  move a knob to a position in 0..1", "knob <k> <v>".bright_white());
    println!("  {}  show the LED register", "leds".bright_white());
    println!("  {}  show connections, negotiations and knobs", "patch".bright_white());
    println!("  {}", "quit".bright_white());
}

fn describe_button(config: &AppConfig, button: usize) {
    match config.jack_for_button(button) {
        Some(jack) => println!("  {}", format!("jack {} '{}' ({:?})", jack.id, jack.name, jack.direction).dimmed()),
        None if config.panel.modifier_button == Some(button) => println!("  {}", "modifier".dimmed()),
        None => println!("  {}", "unbound button".dimmed()),
    }
}

fn hold(sim: &SimPanel, button: usize, ms: u64) {
    sim.press(button);
    thread::sleep(Duration::from_millis(ms));
    sim.release(button);
}

fn print_patch(status: &LoopStatus, reader: &KnobReader) {
    if status.connections.is_empty() {
        println!("  {}", "no connections".dimmed());
    }
    for c in &status.connections {
        println!("  {} -> {} x{}", c.source.to_string().green(), c.dest.to_string().green(), c.scale);
    }
    for (source, state) in &status.sessions {
        println!("  {} {:?}", source.to_string().yellow(), state);
    }
    for knob in 0..reader.len() {
        let values: Vec<String> = (0..MODES)
            .map(|mode| reader.get(knob, mode).map_or_else(|| "-".to_string(), |v| format!("{:.3}", v)))
            .collect();
        println!("  knob {}: {}", knob, values.join(" / "));
    }
}

/// Run the REPL on the calling thread until `quit` or end of input
pub fn run_repl(
    config: AppConfig,
    sim: SimPanel,
    status: watch::Receiver<LoopStatus>,
    reader: KnobReader,
) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    let prompt = format!("U{}> ", config.unit.id);
    let raw_max = config.panel.raw_max;

    println!("{}", "Simulated panel, type 'help' for commands".dimmed());

    loop {
        let line = match rl.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line.as_str());

        match parse_command(&config, &line) {
            Ok(Command::Press(button)) => {
                describe_button(&config, button);
                hold(&sim, button, TAP_MS);
            }
            Ok(Command::Hold(button, ms)) => {
                describe_button(&config, button);
                hold(&sim, button, ms);
            }
            Ok(Command::Knob(knob, value)) => {
                // Pots read inverted
                let raw = raw_max - (value * f32::from(raw_max)).round() as u16;
                sim.set_knob(knob, raw);
            }
            Ok(Command::Leds) => println!("  {:032b}", sim.leds()),
            Ok(Command::Patch) => print_patch(&status.borrow(), &reader),
            Ok(Command::Help) => print_help(),
            Ok(Command::Quit) => break,
            Err(e) => println!("{} {:#}", "error:".red(), e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig::from_yaml(
            "unit: { id: 1 }\npanel:\n  jacks:\n    - { id: 0, name: lfo, direction: output, signal: cv, button: 4, led: 0 }\n",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_commands() {
        let config = config();
        assert_eq!(parse_command(&config, "press 2").unwrap(), Command::Press(2));
        assert_eq!(parse_command(&config, "press LFO").unwrap(), Command::Press(4));
        assert_eq!(parse_command(&config, "hold lfo").unwrap(), Command::Hold(4, DEFAULT_HOLD_MS));
        assert_eq!(parse_command(&config, "hold 1 2000").unwrap(), Command::Hold(1, 2000));
        assert_eq!(parse_command(&config, "knob 3 0.5").unwrap(), Command::Knob(3, 0.5));
        assert_eq!(parse_command(&config, "quit").unwrap(), Command::Quit);
    }

    #[test]
    fn test_rejects_bad_input() {
        let config = config();
        assert!(parse_command(&config, "press vco").is_err());
        assert!(parse_command(&config, "knob 0 1.5").is_err());
        assert!(parse_command(&config, "dance").is_err());
        assert!(parse_command(&config, "knob").is_err());
    }
}
