use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use replibank::{
    bail,
    branch::Event,
    config::{write_json, CustomerOutput, Input},
    net::{bind_ephemeral, serve, TcpTransport},
    task::Supervisor,
    Amount, Branch, BranchId, BranchOptions, Customer, CustomerId, Directory,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Replay customer scripts against a cluster of replicated bank branches")]
struct Cli {
    /// Branches and customer scripts, as JSON
    #[arg(short, long, default_value = "input.json")]
    input: PathBuf,
    /// Where the final customer balances are written
    #[arg(short, long, default_value = "output.json")]
    output: PathBuf,
    /// Fail a write if its replication is not acknowledged in time; waits forever if unset
    #[arg(long)]
    propagation_timeout_ms: Option<u64>,
    /// Also dump every branch's logical clock events here
    #[arg(long)]
    branch_events: Option<PathBuf>,
}

#[derive(Serialize)]
struct BranchEvents {
    id: BranchId,
    balance: Amount,
    events: Vec<Event>,
}

#[tokio::main]
async fn main() -> replibank::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let input = Input::load(&cli.input)?;
    let options = BranchOptions {
        propagation_timeout: cli.propagation_timeout_ms.map(Duration::from_millis),
    };

    // listeners stay bound from here on, so no other process can take the ports in between
    let mut listeners = Vec::new();
    let mut directory = Directory::default();
    for config in &input.branches {
        let (listener, addr) = bind_ephemeral(IpAddr::V4(Ipv4Addr::LOCALHOST)).await?;
        directory.insert(config.id, addr)?;
        listeners.push((config, listener));
    }
    let directory = Arc::new(directory);

    let mut supervisor = Supervisor::default();
    let spawner = supervisor.spawner();
    let mut branches = Vec::new();
    for (config, listener) in listeners {
        let branch = Arc::new(Branch::new(
            config.id,
            config.balance,
            directory.peers_of(config.id),
            TcpTransport::new(directory.clone()),
            options.clone(),
        ));
        info!(
            branch = config.id,
            balance = config.balance,
            addr = %directory.branch_addr(config.id)?,
            "branch started"
        );
        spawner.spawn(
            format!("branch {} server", config.id),
            serve(listener, branch.clone(), spawner.clone()),
        );
        branches.push(branch);
    }

    let mut sessions = JoinSet::new();
    for config in &input.customers {
        let mut customer = Customer::new(
            config.id,
            config.events.clone(),
            TcpTransport::new(directory.clone()),
        );
        sessions.spawn(async move { customer.run().await });
    }
    let balances = tokio::select! {
        balances = join_sessions(sessions) => balances?,
        err = supervisor.first_failure() => return Err(err),
        result = tokio::signal::ctrl_c() => {
            result?;
            bail!("interrupted")
        }
    };

    let output = input
        .customers
        .iter()
        .map(|config| CustomerOutput {
            id: config.id,
            balance: balances[&config.id],
        })
        .collect::<Vec<_>>();
    write_json(&cli.output, &output)?;
    info!(path = %cli.output.display(), "customer balances exported");

    if let Some(path) = &cli.branch_events {
        let events = branches
            .iter()
            .map(|branch| BranchEvents {
                id: branch.id(),
                balance: branch.balance(),
                events: branch.events(),
            })
            .collect::<Vec<_>>();
        write_json(path, &events)?;
        info!(path = %path.display(), "branch events exported")
    }

    supervisor.shutdown();
    Ok(())
}

async fn join_sessions(
    mut sessions: JoinSet<replibank::Result<(CustomerId, Amount)>>,
) -> replibank::Result<HashMap<CustomerId, Amount>> {
    let mut balances = HashMap::new();
    while let Some(result) = sessions.join_next().await {
        let (id, balance) = result??;
        info!(customer = id, balance, "customer finished");
        balances.insert(id, balance);
    }
    Ok(balances)
}
