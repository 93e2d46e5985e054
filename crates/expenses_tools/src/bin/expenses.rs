#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};

use expenses_tools::expenses_cli::{
    execute_command, parse_command, CliCommand, DEFAULT_SERVER_ADDR,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

async fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut command = parse_command(&args)?;
    if let CliCommand::Upload { token, .. } = &mut command {
        if token.is_none() {
            *token = env::var("EXPENSES_TOKEN").ok();
        }
    }
    let password = if command.needs_password() {
        Some(read_password()?)
    } else {
        None
    };
    let server_addr = env::var("EXPENSES_SERVER_ADDR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string());

    let output = execute_command(&server_addr, command, password).await?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn read_password() -> Result<String, String> {
    let value = if io::stdin().is_terminal() {
        rpassword::prompt_password("Password:").map_err(|e| e.to_string())?
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        input.trim().to_string()
    };
    if value.trim().is_empty() {
        return Err("password must not be empty".to_string());
    }
    Ok(value)
}
