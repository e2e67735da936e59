use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use agent_fleet::{
    bridge::SidecarFactory,
    config::{AgentsCommand, Cli, Command, LaunchConfig, RunArgs},
    connection::FleetServices,
    dedup::MessageDedup,
    duties::DutyScheduler,
    events::{init_logging, EventEmitter},
    fleet::{merge_profiles, profile_for, Fleet},
    notify::WebhookNotifier,
    registry::AgentRegistry,
    secure_settings::{SecureSettings, COMMAND_PASSWORD},
    state::StateStore,
    whitelist::Whitelist,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command.clone() {
        Command::Run(args) => run(&cli, args).await,
        Command::Setup => run_setup(&cli),
        Command::Agents { action } => run_agents(&cli, action),
    }
}

fn run_setup(cli: &Cli) -> Result<()> {
    let settings = SecureSettings::open(&cli.settings_file);
    let stdin = io::stdin();
    settings
        .run_setup_wizard(stdin.lock(), io::stdout())
        .context("setup wizard failed")?;
    Ok(())
}

fn run_agents(cli: &Cli, action: AgentsCommand) -> Result<()> {
    let store = StateStore::open(&cli.state_file);
    match action {
        AgentsCommand::List => {
            let bots = store.bots();
            if bots.is_empty() {
                println!("No agents recorded in {}", store.path().display());
            }
            for bot in bots {
                println!(
                    "{:<20} {:<8} {:<28} {}",
                    bot.username,
                    format!("{:?}", bot.state).to_lowercase(),
                    bot.server_address,
                    bot.farm.as_deref().unwrap_or("-"),
                );
            }
        }
        AgentsCommand::Remove { username } => {
            if store.remove_bot(&username)? {
                println!("Removed {username}");
            } else {
                println!("No agent named {username}");
            }
        }
    }
    Ok(())
}

async fn run(cli: &Cli, args: RunArgs) -> Result<()> {
    let settings = SecureSettings::open(&cli.settings_file);
    let launch = if cli.launch_file.exists() {
        LaunchConfig::load(&cli.launch_file)?
    } else {
        tracing::warn!(
            target = "agent_fleet::main",
            path = %cli.launch_file.display(),
            "launch file not found; only resuming recorded agents"
        );
        LaunchConfig::default()
    };
    let endpoint = launch.endpoint(&settings)?;

    let external = Whitelist::sync_external(&cli.whitelist_dir).await;
    let whitelist = Whitelist::new(launch.whitelist.iter().cloned()).with_external(external);
    tracing::info!(
        target = "agent_fleet::main",
        configured = launch.whitelist.len(),
        external = whitelist.external_len(),
        "whitelist loaded"
    );

    let farms = launch.selected_farms(&args.farms);
    for name in &args.farms {
        if !farms.iter().any(|group| &group.name == name) {
            tracing::warn!(target = "agent_fleet::main", farm = %name, "no such farm in launch file");
        }
    }

    let state = Arc::new(StateStore::open(&cli.state_file));
    let fleet_settings = launch.fleet_settings();
    let notifier = WebhookNotifier::from_settings(&settings);
    if !notifier.is_enabled() {
        tracing::info!(target = "agent_fleet::main", "webhook notifications disabled");
    }

    let fleet = Fleet::new(FleetServices {
        registry: Arc::new(AgentRegistry::new()),
        dedup: Arc::new(MessageDedup::new(fleet_settings.dedup_window)),
        state: state.clone(),
        notifier: Arc::new(notifier),
        factory: Arc::new(SidecarFactory::new(launch.sidecar.clone())),
        scheduler: Arc::new(DutyScheduler::new(farms, state)),
        whitelist: Arc::new(whitelist),
        settings: Arc::new(fleet_settings),
        events: EventEmitter::new(cli.json_output),
        command_password: settings.get_opt(COMMAND_PASSWORD),
        shutdown: CancellationToken::new(),
    });

    let resumed = if args.no_resume {
        Vec::new()
    } else {
        fleet.resume_profiles(&launch.accounts, &endpoint)
    };
    let selected = launch
        .selected_accounts(&args.farms)
        .iter()
        .map(|account| profile_for(account, &endpoint))
        .collect();
    let profiles = merge_profiles(resumed, selected);
    tracing::info!(
        target = "agent_fleet::main",
        agents = profiles.len(),
        host = %endpoint.host,
        port = endpoint.port,
        "starting fleet"
    );

    let launcher = {
        let fleet = fleet.clone();
        tokio::spawn(async move { fleet.launch(profiles).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!(target = "agent_fleet::main", "ctrl-c received");

    fleet.shutdown().await;
    let _ = launcher.await;
    Ok(())
}
