//! A command-line tool for creating, inspecting and managing encrypted polls.
//! Voting and revealing need an FHE SDK binding, so against a real ledger
//! they are only available through the library; `simulate` runs the whole
//! lifecycle against an in-process ledger instead.

use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info};

use secret_ballot::{
    clock::{Clock, SystemClock},
    config::Config,
    ledger::{EventFeed, LedgerGateway, RpcLedger},
    model::poll::{Poll, PollFilter, PollId, PollSpec, Tally},
    pipeline::{PollManager, ResultReveal, VoteSubmission},
    simulation::Network,
    Error, ErrorKind, Result,
};

const PROGRAM_NAME: &str = "secret-ballot";

const ABOUT_TEXT: &str = "Create, inspect and manage encrypted polls on an FHEVM ledger.

Settings are read from Ballot.toml and BALLOT_* environment variables.
Commands that send transactions need BALLOT_PRIVATE_KEY.

EXIT CODES:
     0: Success.
   255: Ran successfully, but the poll or the ledger refused the action.
 Other: Error.";

const POLL_ID: &str = "POLL_ID";
const FILTER: &str = "FILTER";
const QUESTION: &str = "QUESTION";
const OPTION: &str = "OPTION";
const DURATION: &str = "DURATION";
const FROM_BLOCK: &str = "FROM_BLOCK";
const VOTE: &str = "VOTE";

/// Construct the CLI configuration.
fn cli() -> Command {
    // Make the build dirty when the toml changes.
    include_str!("../Cargo.toml");

    let poll_id = || {
        Arg::new(POLL_ID)
            .help("The poll's id on the ledger")
            .value_parser(value_parser!(PollId))
            .action(ArgAction::Set)
            .required(true)
    };
    let option = || {
        Arg::new(OPTION)
            .long("option")
            .short('o')
            .help("An option label; give 2 to 5")
            .action(ArgAction::Append)
    };

    clap::command!(PROGRAM_NAME)
        .about(ABOUT_TEXT)
        .subcommand_required(true)
        .subcommand(
            Command::new("status")
                .about("Show a poll, its phase and, once revealed, its results")
                .arg(poll_id()),
        )
        .subcommand(
            Command::new("list").about("List polls, open ones first").arg(
                Arg::new(FILTER)
                    .long("filter")
                    .help("Which polls to show; `mine` means created by this account")
                    .value_parser(["all", "active", "ended", "mine"])
                    .default_value("all")
                    .action(ArgAction::Set),
            ),
        )
        .subcommand(
            Command::new("create")
                .about("Create a poll")
                .arg(
                    Arg::new(QUESTION)
                        .help("The question to ask")
                        .action(ArgAction::Set)
                        .required(true),
                )
                .arg(option().required(true))
                .arg(
                    Arg::new(DURATION)
                        .long("duration")
                        .short('d')
                        .help("Minutes until voting ends")
                        .value_parser(value_parser!(i64))
                        .default_value("60")
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("close")
                .about("Close an expired poll so its results can be revealed")
                .arg(poll_id()),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a poll you created")
                .arg(poll_id()),
        )
        .subcommand(
            Command::new("watch")
                .about("Print ledger events as they happen, until interrupted")
                .arg(
                    Arg::new(FROM_BLOCK)
                        .long("from-block")
                        .help("First block to report events from")
                        .value_parser(value_parser!(u64))
                        .default_value("0")
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a whole poll, from creation to revealed results, on an in-process ledger")
                .arg(option())
                .arg(
                    Arg::new(VOTE)
                        .long("vote")
                        .short('v')
                        .help("The option index one more voter picks")
                        .value_parser(value_parser!(usize))
                        .action(ArgAction::Append),
                ),
        )
}

/// The exit code for a failed command.
fn exit_code(err: &Error) -> u8 {
    match err.kind() {
        ErrorKind::Configuration
        | ErrorKind::LedgerUnavailable
        | ErrorKind::EngineNotReady
        | ErrorKind::Encryption
        | ErrorKind::Decryption => 1,
        _ => 255,
    }
}

fn poll_filter(name: &str, account: ethers::types::Address) -> PollFilter {
    match name {
        "active" => PollFilter::Active,
        "ended" => PollFilter::Ended,
        "mine" => PollFilter::CreatedBy(account),
        _ => PollFilter::All,
    }
}

fn describe(poll: &Poll, now: chrono::DateTime<chrono::Utc>) -> String {
    let phase = poll.phase(now);
    match poll.time_remaining(now) {
        Some(remaining) => format!("#{} [{phase}, {remaining}] {}", poll.id, poll.question),
        None => format!("#{} [{phase}] {}", poll.id, poll.question),
    }
}

async fn status(manager: &PollManager, poll_id: PollId) -> Result<()> {
    let (poll, voted) = futures::try_join!(manager.poll(poll_id), manager.has_voted(poll_id))?;
    println!("{}", describe(&poll, SystemClock.now()));
    println!("Created by {:?}, voting ends {}", poll.creator, poll.end_time);
    match Tally::of(&poll) {
        Some(tally) => println!("{tally}"),
        None => {
            for (index, label) in poll.options.iter().enumerate() {
                println!("  {index}: {label}");
            }
        }
    }
    if voted {
        println!("You have voted on this poll.");
    }
    Ok(())
}

async fn list(manager: &PollManager, args: &ArgMatches) -> Result<()> {
    let name = args.get_one::<String>(FILTER).map_or("all", String::as_str);
    let polls = manager
        .list_polls(poll_filter(name, manager.account()))
        .await?;
    if polls.is_empty() {
        println!("No polls found.");
    }
    let now = SystemClock.now();
    for poll in polls {
        println!("{}", describe(&poll, now));
    }
    Ok(())
}

async fn create(manager: &PollManager, args: &ArgMatches) -> Result<()> {
    let question = args.get_one::<String>(QUESTION).map_or("", String::as_str);
    let options = args
        .get_many::<String>(OPTION)
        .map(|options| options.cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    let duration = args.get_one::<i64>(DURATION).copied().unwrap_or(60);

    let spec = PollSpec::new(question, options.as_slice(), duration)?;
    let (poll_id, receipt) = manager.create_poll(&spec).await?;
    println!("Created poll {poll_id} in transaction {:?}", receipt.tx_hash);
    Ok(())
}

async fn watch(ledger: Arc<dyn LedgerGateway>, config: &Config, args: &ArgMatches) -> Result<()> {
    let from_block = args.get_one::<u64>(FROM_BLOCK).copied().unwrap_or(0);
    let mut feed = EventFeed::spawn(ledger, from_block, config.event_poll_interval());
    println!("Watching for events from block {from_block}, press Ctrl-C to stop.");
    loop {
        tokio::select! {
            event = feed.next() => match event {
                Some(event) => println!("{event}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    feed.stop();
    Ok(())
}

/// Run a command against the configured ledger.
async fn ledger_command(command: &str, args: &ArgMatches) -> Result<()> {
    let config = Config::load()?;
    info!("Connecting to {:?} at {}", config.contract_address(), config.rpc_url());
    let ledger: Arc<dyn LedgerGateway> = Arc::new(RpcLedger::connect(&config)?);
    let manager = PollManager::new(ledger.clone(), Arc::new(SystemClock));
    // Every command that takes a poll id requires it.
    let poll_id = args.get_one::<PollId>(POLL_ID).copied().unwrap_or_default();

    match command {
        "status" => status(&manager, poll_id).await,
        "list" => list(&manager, args).await,
        "create" => create(&manager, args).await,
        "close" => {
            let receipt = manager.close_poll(poll_id).await?;
            println!("Closed poll {poll_id} in transaction {:?}", receipt.tx_hash);
            Ok(())
        }
        "delete" => {
            let receipt = manager.delete_poll(poll_id).await?;
            println!("Deleted poll {poll_id} in transaction {:?}", receipt.tx_hash);
            Ok(())
        }
        "watch" => watch(ledger, &config, args).await,
        _ => Ok(()),
    }
}

/// Create a poll on a fresh simulated ledger, vote on it, let it expire,
/// close it and reveal the results.
async fn simulate(args: &ArgMatches) -> Result<()> {
    let options = args
        .get_many::<String>(OPTION)
        .map(|options| options.cloned().collect::<Vec<_>>())
        .unwrap_or_else(|| vec!["A".to_string(), "B".to_string()]);
    let votes = args
        .get_many::<usize>(VOTE)
        .map(|votes| votes.copied().collect::<Vec<_>>())
        .unwrap_or_else(|| vec![0]);

    let network = Network::new();
    let clock = Arc::new(network.clock());
    let engine = network.engine();
    let creator = network.account("creator");
    let manager = PollManager::new(Arc::new(creator.clone()), clock.clone());

    let spec = PollSpec::new("Simulated poll", options.as_slice(), 60)?;
    let (poll_id, _) = manager.create_poll(&spec).await?;
    println!("Created poll {poll_id} with options {:?}", spec.options());

    for (number, option) in votes.into_iter().enumerate() {
        let voter = network.account(&format!("voter-{number}"));
        VoteSubmission::new(Arc::new(voter.clone()), engine.clone(), clock.clone())
            .submit_vote(poll_id, option)
            .await?;
        println!("{} voted", voter.name());
    }

    clock.advance(chrono::Duration::minutes(61));
    manager.close_poll(poll_id).await?;
    println!("Closed poll {poll_id}");

    ResultReveal::new(Arc::new(creator), engine, clock)
        .reveal_results(poll_id)
        .await?;
    let poll = manager.poll(poll_id).await?;
    if let Some(tally) = Tally::of(&poll) {
        println!("{tally}");
    }
    Ok(())
}

/// Run the chosen command, report the outcome, and return the exit code.
async fn run(args: &ArgMatches) -> u8 {
    let outcome = match args.subcommand() {
        Some(("simulate", sub_args)) => simulate(sub_args).await,
        Some((command, sub_args)) => ledger_command(command, sub_args).await,
        None => Ok(()),
    };
    match outcome {
        Ok(()) => 0,
        Err(err) => {
            let code = exit_code(&err);
            if code == 255 {
                println!("Refused: {err}");
            } else {
                error!("{err}");
                println!("Error: {err}");
            }
            code
        }
    }
}

#[tokio::main]
async fn main() {
    // Set up logging.
    if let Err(err) = log4rs::init_file("log4rs.yaml", Default::default()) {
        eprintln!("Failed to initialise logging: {err}");
    }

    let args = cli().get_matches();
    let exit_code = run(&args).await;
    std::process::exit(exit_code.into())
}
