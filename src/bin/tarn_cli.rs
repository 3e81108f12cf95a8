use std::{
    error::Error,
    io::{self, Write},
    process,
    time::Duration,
};

use clap::Parser;
use log::debug;

use tarn::{
    Client, ClientConfig, ClusterConfig, Command, ConnectionError, cli::PromptError,
    cli::render_schema, prompt, render,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server addresses as host:port
    #[arg(required = true)]
    addresses: Vec<String>,
    /// User to authenticate as
    #[arg(short, long)]
    user: Option<String>,
    /// Password for --user
    #[arg(short, long, default_value = "", requires = "user")]
    password: String,
    /// Per-operation timeout in milliseconds
    #[arg(short, long, default_value_t = 3000)]
    timeout: u64,
    /// Poll this function for cluster members and retry transient failures
    #[arg(long)]
    discovery: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::default()
        .with_addresses(cli.addresses)
        .with_operation_timeout(Some(Duration::from_millis(cli.timeout)));
    if let Some(user) = cli.user {
        config = config.with_credentials(user, cli.password);
    }
    if let Some(function) = cli.discovery {
        config = config
            .with_cluster(ClusterConfig::default().with_discovery(function, Duration::from_secs(60)));
    }

    let mut client = Client::connect(config)?;

    let engine = client.engine().clone();
    ctrlc::set_handler(move || {
        engine.close(ConnectionError::Closed("interrupted".into()).into());
        process::exit(130);
    })?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        let cmd = match prompt(stdin.lock(), &mut stdout) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => break,
            Err(PromptError::Io(e)) => return Err(e.into()),
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Schema => writeln!(stdout, "{}", render_schema(&client.schema().snapshot()))?,
            Command::Request(request) => match client.execute(request).wait() {
                Ok(response) => writeln!(stdout, "{}", render(&response))?,
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }

    debug!("closing client");
    client.close();
    Ok(())
}
