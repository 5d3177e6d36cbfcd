//! CLI client for the teleworker server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;

use teleworker::client::Client;
use teleworker::config::TlsPaths;
use teleworker::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "telerun")]
#[command(about = "Run commands on a teleworker server")]
struct Cli {
    /// Server address (host:port)
    #[arg(long, default_value = "127.0.0.1:50051")]
    addr: String,

    /// Server name the certificate is verified against
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Path to the CA certificate PEM
    #[arg(long, default_value = "certs/ca.crt")]
    ca: PathBuf,

    /// Path to the client certificate PEM
    #[arg(long, default_value = "certs/alice.crt")]
    cert: PathBuf,

    /// Path to the client private key PEM
    #[arg(long, default_value = "certs/alice.key")]
    key: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command on the server
    Start {
        /// Command and arguments, e.g. `telerun start -- sleep 60`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Get the status of a job
    Status { job_id: String },
    /// Stop a running job
    Stop { job_id: String },
    /// Stream the output of a job
    Logs { job_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    teleworker::logging::init();

    let cli = Cli::parse();

    let tls = TlsIdentity::load(&TlsPaths {
        ca_cert_path: cli.ca.clone(),
        cert_path: cli.cert.clone(),
        key_path: cli.key.clone(),
    })
    .await?;
    let mut client = Client::connect(&cli.addr, tls.client_tls_config(&cli.server_name)).await?;

    match cli.command {
        Command::Start { command } => {
            let program = command[0].clone();
            let args = command[1..].to_vec();
            let job_id = client.start_job(program, args).await?;
            println!("{{\n  \"job_id\": \"{job_id}\"\n}}");
        }
        Command::Status { job_id } => {
            let (status, exit_code) = client.job_status(&job_id).await?;
            match exit_code {
                Some(code) => {
                    println!("{{\n  \"status\": \"{status}\",\n  \"exit_code\": {code}\n}}");
                }
                None => println!("{{\n  \"status\": \"{status}\"\n}}"),
            }
        }
        Command::Stop { job_id } => {
            client.stop_job(&job_id).await?;
            println!("{{\n  \"stopped\": \"{job_id}\"\n}}");
        }
        Command::Logs { job_id } => {
            let mut stream = client.stream_output(&job_id).await?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = stream.message().await? {
                stdout.write_all(&chunk.data).await?;
                stdout.flush().await?;
            }
        }
    }

    Ok(())
}
