//! Host-side harness for exercising the core outside real silicon (spec
//! §1's out-of-scope "concrete MCU drivers" stay out of scope; this binary
//! drives the in-memory [`defender::hal::fake`] backends instead), mirroring
//! the teacher's `clap`-derived `cardinal` binary.

use clap::Parser;
use defender::bridge::m4::run_terminal_only;
use defender::config::Config;
use defender::hal::fake::{FakeSideIo, FakeWatchdog};
use defender::link::{Convention, Side, SideKind, Tc1};
use defender::log::{Logger, MIN_CAPACITY};
use tracing::{debug, info};

/// Feeds a hex-encoded byte script into a fake card wire (even parity is
/// computed for each byte, matching what a real sender would put on the
/// line) and runs one of the bridge modes against it.
#[derive(Parser, Debug)]
#[command(name = "defender", about = "Host-side harness for the Defender core")]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run M4 (terminal-only) against a scripted fake card: cold reset,
    /// SELECT, GET PROCESSING OPTIONS, READ RECORD, GENERATE AC.
    TerminalOnly {
        /// Whitespace-separated hex bytes the fake card will answer with,
        /// in the exact order the core reads them off the wire.
        #[arg(long, value_delimiter = ' ')]
        card_script: Vec<String>,
    },
}

fn init_logging(verbosity: u8) {
    tracing_subscriber::fmt()
        .without_time()
        .with_target(false)
        .with_max_level(match verbosity {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        })
        .init();
}

fn fake_card_from_script(script: &[String]) -> anyhow::Result<FakeSideIo> {
    let mut io = FakeSideIo::new();
    for token in script {
        let byte = u8::from_str_radix(token, 16)?;
        io.inbound
            .push_back((byte, Convention::parity_of_wire_bits(byte)));
    }
    Ok(io)
}

fn run_terminal_only_command(cli: &Cli, script: &[String]) -> anyhow::Result<()> {
    let config = Config::default();
    let io = fake_card_from_script(script)?;
    let mut card = Side::new(SideKind::Card, Convention::Direct, Tc1::DEFAULT, io);
    let mut logger = Logger::new(MIN_CAPACITY);
    let mut watchdog = FakeWatchdog::default();

    debug!(?cli, "starting M4 terminal-only session");
    let outcome = run_terminal_only(
        &mut card,
        config.card_frequency,
        &config.m4_config(),
        &mut logger,
        &mut watchdog,
    )?;

    info!(selected_aid = ?outcome.selected_aid, "application selected");
    println!(
        "GENERATE AC: SW={:02X}{:02X} data={}",
        outcome.generate_ac_response.sw1,
        outcome.generate_ac_response.sw2,
        hex::encode_upper(&outcome.generate_ac_response.data),
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Command::TerminalOnly { card_script } => run_terminal_only_command(&cli, card_script),
    }
}
