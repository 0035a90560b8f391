use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use log::warn;

use pcba::codec::{self, to_hex, CommandFrame, RelayKey, VoltageChannel, DEFAULT_LINK_TEST_PAYLOAD};
use pcba::sequencer::{SequencerEvent, SequencerState};
use pcba::{catalog, BenchConfig, BoardSimulator, LinkController, LinkEvent, SerialTransport, SimulatedTransport};
use pcba::{TestBench, Transport};

/// How long the run loop waits for a key before servicing the link again.
const KEY_POLL: Duration = Duration::from_millis(20);

/// Production test bench for the PCBA fixture
#[derive(Parser)]
#[command(name = "bench_cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports
    Ports,

    /// Run a test sequence (keys: p pause, r resume, s stop, y/n answer)
    Run {
        /// Serial port (overrides [serial].port)
        #[arg(short, long)]
        port: Option<String>,

        /// Step file in interchange JSON (defaults to the built-in PCBA sequence)
        #[arg(long, value_name = "FILE")]
        steps: Option<PathBuf>,

        /// Run against the built-in board simulator instead of hardware
        #[arg(long)]
        simulate: bool,

        /// Current the simulated meter reports, in mA
        #[arg(long, default_value = "0.001")]
        sim_current: f32,
    },

    /// Write the built-in PCBA sequence as interchange JSON
    ExportSteps {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Send one command and wait for its confirmation
    Send {
        #[arg(short, long)]
        port: Option<String>,

        #[command(subcommand)]
        command: ManualCommand,
    },

    /// Make the slave board jump to its bootloader
    Bootloader {
        #[arg(short, long)]
        port: Option<String>,
    },
}

#[derive(Subcommand, Clone, Debug)]
enum ManualCommand {
    PowerOn,
    PowerOff,
    StartDetection,
    StopDetection,
    /// Legacy pause (0xAA)
    PauseDetection,
    /// Press a relay-simulated key
    Key {
        #[arg(value_enum)]
        key: KeyArg,
    },
    /// Set a rail voltage
    Voltage {
        #[arg(value_enum)]
        channel: ChannelArg,
        volts: f64,
    },
    OpenChannel {
        #[arg(value_enum)]
        channel: ChannelArg,
    },
    /// Echo test with hex bytes (default: 34 34)
    LinkTest {
        #[arg(value_name = "HEX")]
        payload: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KeyArg {
    Right,
    Power,
    Sw3,
    Sw4,
    Sw5,
    Sw6,
}

impl From<KeyArg> for RelayKey {
    fn from(key: KeyArg) -> Self {
        match key {
            KeyArg::Right => RelayKey::Right,
            KeyArg::Power => RelayKey::PowerConfirm,
            KeyArg::Sw3 => RelayKey::Sw3,
            KeyArg::Sw4 => RelayKey::Sw4,
            KeyArg::Sw5 => RelayKey::Sw5,
            KeyArg::Sw6 => RelayKey::Sw6,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ChannelArg {
    V1,
    V2,
    V3,
    V4,
}

impl From<ChannelArg> for VoltageChannel {
    fn from(channel: ChannelArg) -> Self {
        match channel {
            ChannelArg::V1 => VoltageChannel::V1,
            ChannelArg::V2 => VoltageChannel::V2,
            ChannelArg::V3 => VoltageChannel::V3,
            ChannelArg::V4 => VoltageChannel::V4,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level));
    if matches!(cli.command, Commands::Run { .. }) {
        // The run loop keeps the terminal in raw mode.
        logger.format(|buf, record| writeln!(buf, "[{} {}] {}\r", record.level(), record.target(), record.args()));
    }
    logger.init();

    let config = match &cli.config {
        Some(path) => BenchConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => BenchConfig::default(),
    };

    match cli.command {
        Commands::Ports => list_ports()?,
        Commands::Run { port, steps, simulate, sim_current } => {
            let steps = match steps {
                Some(path) => catalog::load(&path)
                    .with_context(|| format!("Failed to load steps: {}", path.display()))?,
                None => catalog::pcba_sequence(),
            };
            let all_passed = if simulate {
                let mut board = BoardSimulator::new(config.link_config().slave_address);
                board.current_ma = sim_current;
                let bench = TestBench::new(
                    SimulatedTransport::new(board),
                    config.link_config(),
                    config.sequencer_config(),
                );
                run_sequence(bench, steps)?
            } else {
                let transport = open_port(&config, port.as_deref())?;
                let bench = TestBench::new(transport, config.link_config(), config.sequencer_config());
                run_sequence(bench, steps)?
            };
            if !all_passed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::ExportSteps { file } => export_steps(&file)?,
        Commands::Send { port, command } => {
            let transport = open_port(&config, port.as_deref())?;
            let mut link = LinkController::new(transport, config.link_config());
            send_manual(&mut link, &command)?;
        }
        Commands::Bootloader { port } => {
            let transport = open_port(&config, port.as_deref())?;
            let mut link = LinkController::new(transport, config.link_config());
            link.send_frame(codec::bootloader_jump(), Instant::now())
                .context("Failed to send bootloader jump")?;
            println!("Bootloader jump sent to 0x{:02X}.", link.config().slave_address);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Could not enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}

fn open_port(config: &BenchConfig, port: Option<&str>) -> Result<SerialTransport> {
    let Some(settings) = config.serial_settings(port) else {
        bail!("No serial port given; pass --port or set [serial].port in the config file");
    };
    SerialTransport::open(&settings)
        .with_context(|| format!("Failed to open port '{}' at {} baud", settings.port, settings.baud_rate))
}

fn export_steps(file: &Path) -> Result<()> {
    let steps = catalog::pcba_sequence();
    catalog::save(file, &steps).with_context(|| format!("Failed to write steps: {}", file.display()))?;
    println!("Wrote {} steps to {}", steps.len(), file.display());
    Ok(())
}

/// Leaves raw mode when dropped, including on early return.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            warn!("failed to leave raw mode: {e}");
        }
    }
}

fn say(line: &str) {
    print!("{line}\r\n");
    let _ = std::io::stdout().flush();
}

/// Runs the sequence until it finishes or is stopped; returns whether every
/// step passed.
fn run_sequence<T: Transport>(mut bench: TestBench<T>, steps: Vec<catalog::StepSpec>) -> Result<bool> {
    bench.load_steps(steps)?;
    let raw = RawMode::enable()?;
    say("Keys: p pause, r resume, s stop, y/n answer a prompt");
    bench.start(Instant::now())?;

    let mut all_passed = false;
    loop {
        let now = Instant::now();
        bench.tick(now);
        for event in bench.drain_events() {
            if let SequencerEvent::SequenceFinished { all_passed: passed, .. } = event {
                all_passed = passed;
            }
            report(&event);
        }
        if !bench.state().is_active() {
            break;
        }

        let wait = bench
            .next_deadline()
            .map_or(KEY_POLL, |d| d.saturating_duration_since(now))
            .min(KEY_POLL);
        if !event::poll(wait).context("Failed to poll events")? {
            continue;
        }
        let Event::Key(key) = event::read().context("Failed to read event")? else { continue };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let now = Instant::now();
        match key.code {
            KeyCode::Char('p') => bench.pause(now),
            KeyCode::Char('r') => bench.resume(now),
            KeyCode::Char('y') => bench.user_confirm(true, now),
            KeyCode::Char('n') => bench.user_confirm(false, now),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => bench.stop(now),
            KeyCode::Char('s') | KeyCode::Char('q') | KeyCode::Esc => bench.stop(now),
            _ => {}
        }
    }
    // Drain whatever the final stop produced, then leave raw mode before the report.
    for event in bench.drain_events() {
        report(&event);
    }
    drop(raw);

    let errors = bench.sequencer().errors();
    if !errors.is_empty() {
        println!("\nError log:");
        for record in errors {
            println!(
                "  step {} [{}] {}: {} (measured {}, limit {})",
                record.step_index + 1,
                record.action_description,
                record.kind,
                record.detail,
                record.formatted_measured(),
                record.formatted_threshold()
            );
        }
        println!("{}", serde_json::to_string_pretty(errors).context("Failed to serialize error log")?);
    }
    Ok(all_passed && bench.state() == SequencerState::Finished)
}

fn report(event: &SequencerEvent) {
    match event {
        SequencerEvent::StepStarted { id, name, .. } => say(&format!("== Step {id}: {name}")),
        SequencerEvent::ActionStarted { action, description, .. } => {
            say(&format!("   {}. {description}", action + 1))
        }
        SequencerEvent::UserConfirmRequired { prompt } => say(&format!(">> {prompt} [y/n]")),
        SequencerEvent::CurrentCheckResult { measured_ma, threshold_ma, limit, passed } => say(&format!(
            "   current {measured_ma:.3} mA ({} {threshold_ma:.3} mA): {}",
            limit.symbol(),
            if *passed { "PASS" } else { "FAIL" }
        )),
        SequencerEvent::StepFinished { index, passed } => {
            say(&format!("== Step {} {}", index + 1, if *passed { "PASSED" } else { "FAILED" }))
        }
        SequencerEvent::StateChanged(
            state @ (SequencerState::Paused | SequencerState::WaitingForPauseAck | SequencerState::Aborted),
        ) => say(&format!("-- {state}")),
        SequencerEvent::SequenceFinished { passed, total, .. } => {
            say(&format!("Sequence finished: {passed}/{total} steps passed"))
        }
        _ => {}
    }
}

fn manual_frame(command: &ManualCommand) -> Result<CommandFrame> {
    let frame = match command {
        ManualCommand::PowerOn => codec::power_on(),
        ManualCommand::PowerOff => codec::power_off(),
        ManualCommand::StartDetection => codec::start_detection(),
        ManualCommand::StopDetection => codec::stop_detection(),
        ManualCommand::PauseDetection => codec::pause_detection(),
        ManualCommand::Key { key } => codec::relay_key((*key).into()),
        ManualCommand::Voltage { channel, volts } => codec::set_voltage((*channel).into(), *volts)?,
        ManualCommand::OpenChannel { channel } => codec::open_channel((*channel).into()),
        ManualCommand::LinkTest { payload } if payload.is_empty() => codec::link_test(&DEFAULT_LINK_TEST_PAYLOAD)?,
        ManualCommand::LinkTest { payload } => {
            let bytes = payload
                .iter()
                .map(|s| u8::from_str_radix(s.trim_start_matches("0x"), 16))
                .collect::<Result<Vec<u8>, _>>()
                .context("Link test payload must be hex bytes")?;
            codec::link_test(&bytes)?
        }
    };
    Ok(frame)
}

fn send_manual<T: Transport>(link: &mut LinkController<T>, command: &ManualCommand) -> Result<()> {
    let frame = manual_frame(command)?;
    let expects_reply = frame.expected().is_some();
    println!("> {} ({})", frame.command(), to_hex(frame.bytes()));
    link.send_frame(frame, Instant::now()).context("Failed to send command")?;
    if !expects_reply {
        return Ok(());
    }

    loop {
        link.poll(Instant::now());
        for event in link.drain_events() {
            match event {
                LinkEvent::ConfirmationSucceeded { command, matched, .. } => {
                    println!("< {command} confirmed ({})", to_hex(&matched));
                    return Ok(());
                }
                LinkEvent::ConfirmationFailed { command, reason, .. } => bail!("{command} failed: {reason}"),
                LinkEvent::Disconnected { .. } => bail!("Serial port disconnected"),
                LinkEvent::Sample(sample) => println!("  meter: {:.3} mA", sample.value_ma),
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}
