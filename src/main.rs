use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use scout_escrow::{
    chain::{EngagementId, SimulatedChain},
    config::{ConfigError, MarketConfig},
    escrow::EscrowState,
    identity::now_unix,
    market::parse_address,
    session::FileSessionStorage,
    store::SqliteStore,
    EngagementRequest, Failure, Marketplace,
};

//==================== CLI ====================//

#[derive(Debug, Parser)]
#[command(name = "scout-escrow", version, about = "Scout referrals and escrow engagements")]
struct Cli {
    /// TOML config file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides storage.database.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Overrides storage.session_file.
    #[arg(long, global = true)]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    RegisterTalent {
        talent: String,
        percent: u8,
        /// Account creation time (unix seconds); now when omitted.
        #[arg(long)]
        created_at: Option<u64>,
    },
    Capture {
        scout: Option<String>,
        /// Identity of the signed-in visitor; drops any stored referral.
        #[arg(long = "as")]
        identity: Option<String>,
    },
    Peek,
    Consume,
    /// Bind a scout to a client/talent pair at the current commission.
    Lock {
        client: String,
        talent: String,
        scout: String,
    },
    /// Consume the session referral and lock it for a new connection.
    Attribute { client: String, talent: String },
    ProposeRate { talent: String, percent: u8 },
    ShowRate { talent: String },
    Escrow {
        client: String,
        talent: String,
        amount: u64,
        /// Run against the in-process chain simulator.
        #[arg(long)]
        simulate: bool,
        /// Polls before the simulator confirms a transaction.
        #[arg(long, default_value_t = 2)]
        confirm_after: u32,
    },
    Mirror {
        #[command(subcommand)]
        command: MirrorCommand,
    },
}

#[derive(Debug, Subcommand)]
enum MirrorCommand {
    Show { engagement_id: EngagementId },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Failure(#[from] Failure),
    #[error("runtime: {0}")]
    Runtime(#[from] io::Error),
    #[error("{0}")]
    Usage(&'static str),
}

//==================== Helpers ====================//

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("error: cannot encode output: {err}"),
    }
}

fn load_config(cli: &Cli) -> Result<MarketConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => MarketConfig::load(path)?,
        None => MarketConfig::default(),
    };
    if let Some(database) = &cli.database {
        config.storage.database = database.display().to_string();
    }
    if let Some(session_file) = &cli.session_file {
        config.storage.session_file = session_file.display().to_string();
    }
    Ok(config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

//==================== Commands ====================//

fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let config = load_config(&cli)?;
    let store = SqliteStore::open(Path::new(&config.storage.database)).map_err(Failure::from)?;
    let store = Arc::new(store);

    let confirm_after = match &cli.command {
        Command::Escrow { confirm_after, .. } => *confirm_after,
        _ => 0,
    };
    // engagement ids from the clock keep repeated simulations apart in the mirror
    let chain = Arc::new(SimulatedChain::new(confirm_after).with_first_engagement(now_unix()));
    let session_file = PathBuf::from(&config.storage.session_file);
    let market = Marketplace::new(config, store, chain);
    let session = || market.session(FileSessionStorage::new(session_file.clone()));

    match cli.command {
        Command::RegisterTalent {
            talent,
            percent,
            created_at,
        } => print_json(&market.register_talent(&talent, percent, created_at)?),
        Command::Capture { scout, identity } => {
            let identity = identity
                .as_deref()
                .map(|raw| parse_address("identity", raw))
                .transpose()?;
            let session = session();
            print_json(&market.capture_referral(&session, scout.as_deref(), identity.as_ref())?);
        }
        Command::Peek => print_json(&market.peek_referral(&session())?),
        Command::Consume => print_json(&market.consume_referral(&session())?),
        Command::Lock {
            client,
            talent,
            scout,
        } => print_json(&market.lock_attribution(&client, &talent, &scout)?),
        Command::Attribute { client, talent } => {
            let session = session();
            print_json(&market.attribute_signup(&session, &client, &talent)?);
        }
        Command::ProposeRate { talent, percent } => {
            print_json(&market.propose_rate_change(&talent, percent)?)
        }
        Command::ShowRate { talent } => print_json(&market.current_rate(&talent)?),
        Command::Escrow {
            client,
            talent,
            amount,
            simulate,
            ..
        } => {
            if !simulate {
                return Err(CliError::Usage(
                    "no chain endpoint is configured; pass --simulate",
                ));
            }
            let request = EngagementRequest {
                client: parse_address("client", &client)?,
                talent: parse_address("talent", &talent)?,
                amount,
            };
            return run_escrow(&market, &request);
        }
        Command::Mirror {
            command: MirrorCommand::Show { engagement_id },
        } => match market.mirror_record(engagement_id)? {
            Some(record) => print_json(&record),
            None => return Err(Failure::MirrorNotFound(engagement_id).into()),
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn run_escrow(
    market: &Marketplace<SimulatedChain, SqliteStore>,
    request: &EngagementRequest,
) -> Result<ExitCode, CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let done = runtime.block_on(async {
        let mut flow = market.start_escrow_flow(request)?;
        while let Some(transition) = flow.transitions.next().await {
            print_json(&transition);
        }
        let (_, done) = flow.finish().await.map_err(Failure::from)?;
        Ok::<_, Failure>(done)
    })?;
    print_json(&done);
    eprintln!("{}", done.summary());
    if done.state == EscrowState::Complete {
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(failure) = done.failure.clone() {
        print_json(&Failure::from(failure).report());
    }
    Ok(ExitCode::from(2))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    match run(cli) {
        Ok(code) => code,
        Err(CliError::Failure(failure)) => {
            eprintln!("error: {failure}");
            print_json(&failure.report());
            ExitCode::from(2)
        }
        Err(CliError::Usage(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_escrow::identity::Address;

    #[test]
    fn parses_nested_mirror_command() {
        let cli = Cli::parse_from(["scout-escrow", "--database", "x.db", "mirror", "show", "42"]);
        assert!(matches!(
            cli.command,
            Command::Mirror {
                command: MirrorCommand::Show { engagement_id: 42 }
            }
        ));
        assert_eq!(cli.database, Some(PathBuf::from("x.db")));
    }

    #[test]
    fn cli_flags_override_config_storage() {
        let cli = Cli::parse_from([
            "scout-escrow",
            "--session-file",
            "/tmp/s.json",
            "capture",
            "0x5c",
            "--as",
            "0xc1",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.storage.session_file, "/tmp/s.json");
        assert_eq!(config.storage.database, "scout-escrow.db");
        let Command::Capture { scout, identity } = cli.command else {
            panic!("expected capture");
        };
        assert_eq!(scout.as_deref(), Some("0x5c"));
        assert!(Address::is_valid(identity.as_deref().unwrap_or_default()));
    }
}
