//! REPL – the operator console.
//!
//! Supported slash-commands:
//!   /help                         – show this list
//!   /status                       – safety state, actuators and counters
//!   /sensor <channel>             – simulate an item passing a sensor
//!   /classify <category> [conf]   – dispatch a classification result
//!   /estop                        – latch the emergency stop
//!   /reset                        – re-validate and clear the emergency stop
//!   /clear <actuator>             – clear an actuator's degraded flag
//!   /belt on|off                  – tell the watchdog whether the belt runs
//!   /temp <actuator> <celsius>    – set a simulated actuator temperature
//!   /extstop on|off               – drive the simulated e-stop input
//!   /quit | /exit                 – return to rest and exit
//!
//! A line starting with `{` is forwarded as a JSON classification message.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::time::Duration;

use colored::Colorize;
use sortline_hal::SimProbe;
use sortline_kernel::SensorConfig;
use sortline_runtime::EngineHandle;
use sortline_types::{Admission, RawEdge, TriggerEvent};
use tokio::runtime::Runtime;
use tokio::time::Instant;

/// Trailing edge of a simulated item, after the leading one.
const SIMULATED_PASS: Duration = Duration::from_millis(30);

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Sensor(u8),
    Classify { category: String, confidence: f32 },
    EmergencyStop,
    Reset,
    Clear(String),
    Belt(bool),
    Temperature { actuator: String, celsius: f32 },
    ExternalStop(bool),
    Json(String),
    Quit,
}

fn on_off(arg: Option<&str>) -> Result<bool, String> {
    match arg {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => Err("expected 'on' or 'off'".to_string()),
    }
}

/// Parse one console line.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.starts_with('{') {
        return Ok(Command::Json(line.to_string()));
    }
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or_default();
    let arg = words.next();
    let extra = words.next();

    let command = match cmd {
        "/help" => Command::Help,
        "/status" => Command::Status,
        "/sensor" => Command::Sensor(
            arg.and_then(|a| a.parse().ok())
                .ok_or("usage: /sensor <channel>")?,
        ),
        "/classify" => {
            let category = arg.ok_or("usage: /classify <category> [confidence]")?;
            let confidence = match extra {
                Some(c) => c.parse().map_err(|_| format!("invalid confidence '{c}'"))?,
                None => 1.0,
            };
            Command::Classify {
                category: category.to_string(),
                confidence,
            }
        }
        "/estop" => Command::EmergencyStop,
        "/reset" => Command::Reset,
        "/clear" => Command::Clear(arg.ok_or("usage: /clear <actuator>")?.to_string()),
        "/belt" => Command::Belt(on_off(arg)?),
        "/temp" => {
            let (Some(actuator), Some(celsius)) = (arg, extra) else {
                return Err("usage: /temp <actuator> <celsius>".to_string());
            };
            Command::Temperature {
                actuator: actuator.to_string(),
                celsius: celsius
                    .parse()
                    .map_err(|_| format!("invalid temperature '{celsius}'"))?,
            }
        }
        "/extstop" => Command::ExternalStop(on_off(arg)?),
        "/quit" | "/exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(command)
}

/// Console session bound to a running engine.
pub struct Console<'a> {
    pub runtime: &'a Runtime,
    pub engine: &'a EngineHandle,
    pub probes: &'a HashMap<String, SimProbe>,
    pub sensors: &'a [SensorConfig],
}

impl Console<'_> {
    /// Read commands from stdin until `/quit` or EOF.
    pub fn run(&self) {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            print!("{} ", "sortline>".bold().cyan());
            stdout.flush().ok();

            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            match parse(&line) {
                Ok(Command::Quit) => {
                    println!("{}", "Returning actuators to rest. Goodbye.".green());
                    break;
                }
                Ok(command) => self.execute(command),
                Err(e) => println!(
                    "{} {}. Type {} for available commands.",
                    "Error:".red(),
                    e,
                    "/help".bold()
                ),
            }
        }
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Help => cmd_help(),
            Command::Status => self.cmd_status(),
            Command::Sensor(channel) => self.cmd_sensor(channel),
            Command::Classify {
                category,
                confidence,
            } => {
                let event = TriggerEvent::classification(category, confidence, Instant::now());
                match self.runtime.block_on(self.engine.dispatch(event)) {
                    Ok(admission) => print_admission(&admission),
                    Err(e) => println!("{}: {}", "Dispatch failed".red(), e),
                }
            }
            Command::EmergencyStop => {
                self.runtime
                    .block_on(self.engine.emergency_stop("operator console"));
                println!("{}", "EMERGENCY STOP latched; actuators at rest.".red().bold());
            }
            Command::Reset => match self.runtime.block_on(self.engine.reset_emergency_stop()) {
                Ok(()) => println!("{}", "✓ Emergency stop cleared.".green()),
                Err(v) => println!("{} {}", "Reset refused:".red(), v),
            },
            Command::Clear(actuator) => {
                match self.runtime.block_on(self.engine.clear_degraded(&actuator)) {
                    Ok(true) => println!("{} {}", "✓ Cleared degraded flag on".green(), actuator.bold()),
                    Ok(false) => println!("  {} was not degraded", actuator.bold()),
                    Err(e) => println!("{}: {}", "Error".red(), e),
                }
            }
            Command::Belt(running) => {
                match self.runtime.block_on(self.engine.set_belt_running(running)) {
                    Ok(()) => println!("  Belt {}", if running { "running" } else { "stopped" }),
                    Err(e) => println!("{}: {}", "Error".red(), e),
                }
            }
            Command::Temperature { actuator, celsius } => match self.probes.get(&actuator) {
                Some(probe) => {
                    probe.set_temperature(celsius);
                    println!("  {} temperature set to {celsius}°C", actuator.bold());
                }
                None => println!("{} '{}'", "Unknown actuator:".red(), actuator.yellow()),
            },
            Command::ExternalStop(asserted) => {
                self.runtime
                    .block_on(self.engine.set_external_stop(asserted));
                println!(
                    "  External stop input {}",
                    if asserted { "asserted".red() } else { "released".green() }
                );
            }
            Command::Json(line) => match self.engine.classification_ingest().submit_json(&line) {
                Ok(()) => println!("  Classification queued"),
                Err(e) => println!("{}: {}", "Ingest error".red(), e),
            },
            Command::Quit => {}
        }
    }

    fn cmd_status(&self) {
        let snap = self.engine.snapshot();
        println!("{}", "Line Status".bold().underline());
        if snap.safety.emergency_stopped {
            println!(
                "  Safety     : {} ({})",
                "EMERGENCY STOP".red().bold(),
                snap.safety.reason.as_deref().unwrap_or("no reason recorded")
            );
        } else {
            println!("  Safety     : {}", "ok".green());
        }
        for a in &snap.actuators {
            let status = if a.degraded {
                "degraded".red()
            } else if a.is_active {
                "active".yellow()
            } else {
                "rest".green()
            };
            println!(
                "  {:<10} : {:<8} pos {:>6.1}  {:>5.1}°C  activations {}",
                a.actuator_id, status, a.current_position, a.temperature_c, a.activation_count
            );
        }
        println!("  Admitted   : {}", snap.dispatch.admitted);
        for (reason, count) in &snap.dispatch.rejected {
            println!("  {:<22} {}", reason.code().dimmed(), count);
        }
        if snap.dropped_snapshots > 0 {
            println!("  Telemetry snapshots dropped: {}", snap.dropped_snapshots);
        }
    }

    fn cmd_sensor(&self, channel: u8) {
        let Some(sensor) = self.sensors.iter().find(|s| s.channel == channel) else {
            println!("{} {}", "No sensor configured on channel".red(), channel);
            return;
        };
        let now = Instant::now();
        let edges = [
            RawEdge {
                channel,
                level: sensor.active_level,
                timestamp: now,
            },
            RawEdge {
                channel,
                level: !sensor.active_level,
                timestamp: now + SIMULATED_PASS,
            },
        ];
        for edge in edges {
            if let Err(e) = self.engine.submit_edge(edge) {
                println!("{}: {}", "Error".red(), e);
                return;
            }
        }
        println!("  Item passed sensor {channel}");
    }
}

fn print_admission(admission: &Admission) {
    match admission {
        Admission::Admitted(req) => println!(
            "  {} {} → {:.1} for {} ms",
            "admitted".green(),
            req.actuator_id.bold(),
            req.target_position,
            req.duration.as_millis()
        ),
        Admission::Rejected(reason) => println!("  {} {}", "rejected:".yellow(), reason),
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Sortline Commands".bold().underline());
    println!("  {}                     – safety, actuators, counters", "/status".bold().cyan());
    println!("  {}            – simulate an item at a sensor", "/sensor <ch>".bold().cyan());
    println!("  {} – dispatch a classification", "/classify <cat> [conf]".bold().cyan());
    println!("  {}                      – latch the emergency stop", "/estop".bold().cyan());
    println!("  {}                      – re-validate and clear it", "/reset".bold().cyan());
    println!("  {}                 – clear a degraded actuator", "/clear <id>".bold().cyan());
    println!("  {}              – belt state for the watchdog", "/belt on|off".bold().cyan());
    println!("  {}           – simulated temperature", "/temp <id> <c>".bold().cyan());
    println!("  {}           – simulated e-stop input", "/extstop on|off".bold().cyan());
    println!("  {}                – exit", "/quit  /exit".bold().cyan());
    println!("  Lines starting with {} are JSON classification messages.", "{".bold());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(parse("/sensor 17"), Ok(Command::Sensor(17)));
        assert_eq!(
            parse("  /classify apple 0.8 "),
            Ok(Command::Classify {
                category: "apple".to_string(),
                confidence: 0.8
            })
        );
        assert_eq!(
            parse("/classify pear"),
            Ok(Command::Classify {
                category: "pear".to_string(),
                confidence: 1.0
            })
        );
        assert_eq!(parse("/belt off"), Ok(Command::Belt(false)));
        assert_eq!(
            parse("/temp stepper1 70"),
            Ok(Command::Temperature {
                actuator: "stepper1".to_string(),
                celsius: 70.0
            })
        );
        assert_eq!(parse("/exit"), Ok(Command::Quit));
    }

    #[test]
    fn json_lines_are_passed_through() {
        let line = r#"{"category":"lemon","confidence":0.7,"timestamp":"2024-01-01T00:00:00Z"}"#;
        assert_eq!(parse(line), Ok(Command::Json(line.to_string())));
    }

    #[test]
    fn bad_input_is_reported() {
        assert!(parse("/sensor").is_err());
        assert!(parse("/sensor x").is_err());
        assert!(parse("/belt maybe").is_err());
        assert!(parse("/temp apple").is_err());
        assert!(parse("/classify apple high").is_err());
        assert!(parse("/launch").is_err());
    }
}
