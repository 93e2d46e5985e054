#![forbid(unsafe_code)]

use std::path::PathBuf;

use expenses_adapter::grpc_api::{
    expenses_service_client::ExpensesServiceClient, users_service_client::UsersServiceClient,
    CheckAuthTokenRequest, CreateExpenseRequest, CreateUserRequest, GetUserRequest,
};
use tonic::metadata::{Ascii, MetadataValue};

pub const DEFAULT_SERVER_ADDR: &str = "http://127.0.0.1:50051";
pub const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

pub const USAGE: &str = "usage: expenses <create-user|login|check|upload> ...\n  \
    expenses create-user <username> [--email E] [--first-name F] [--last-name L]\n  \
    expenses login <username>\n  \
    expenses check <token>\n  \
    expenses upload <file> [--token T]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    CreateUser {
        username: String,
        email: String,
        first_name: String,
        last_name: String,
    },
    Login {
        username: String,
    },
    Check {
        token: String,
    },
    Upload {
        path: PathBuf,
        token: Option<String>,
    },
}

impl CliCommand {
    pub fn needs_password(&self) -> bool {
        matches!(self, Self::CreateUser { .. } | Self::Login { .. })
    }
}

pub fn parse_command(args: &[String]) -> Result<CliCommand, String> {
    let (subcommand, rest) = args.split_first().ok_or_else(|| USAGE.to_string())?;
    match subcommand.as_str() {
        "create-user" => {
            let (username, flags) = positional(rest, "create-user <username>")?;
            let mut email = String::new();
            let mut first_name = String::new();
            let mut last_name = String::new();
            for (flag, value) in flag_pairs(flags)? {
                match flag {
                    "--email" => email = value.to_string(),
                    "--first-name" => first_name = value.to_string(),
                    "--last-name" => last_name = value.to_string(),
                    other => return Err(format!("unknown flag for create-user: {other}")),
                }
            }
            Ok(CliCommand::CreateUser {
                username,
                email,
                first_name,
                last_name,
            })
        }
        "login" => {
            let (username, flags) = positional(rest, "login <username>")?;
            reject_flags("login", flags)?;
            Ok(CliCommand::Login { username })
        }
        "check" => {
            let (token, flags) = positional(rest, "check <token>")?;
            reject_flags("check", flags)?;
            Ok(CliCommand::Check { token })
        }
        "upload" => {
            let (path, flags) = positional(rest, "upload <file>")?;
            let mut token = None;
            for (flag, value) in flag_pairs(flags)? {
                match flag {
                    "--token" => token = Some(value.to_string()),
                    other => return Err(format!("unknown flag for upload: {other}")),
                }
            }
            Ok(CliCommand::Upload {
                path: PathBuf::from(path),
                token,
            })
        }
        other => Err(format!("unknown subcommand: {other}\n{USAGE}")),
    }
}

fn positional<'a>(rest: &'a [String], usage: &str) -> Result<(String, &'a [String]), String> {
    match rest.split_first() {
        Some((first, flags)) if !first.starts_with("--") && !first.trim().is_empty() => {
            Ok((first.clone(), flags))
        }
        _ => Err(format!("usage: expenses {usage}")),
    }
}

fn flag_pairs(flags: &[String]) -> Result<Vec<(&str, &str)>, String> {
    if flags.len() % 2 != 0 {
        return Err(format!(
            "flag {} is missing a value",
            flags.last().map(String::as_str).unwrap_or("")
        ));
    }
    Ok(flags
        .chunks(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .collect())
}

fn reject_flags(subcommand: &str, flags: &[String]) -> Result<(), String> {
    match flags.first() {
        Some(flag) => Err(format!("unexpected argument for {subcommand}: {flag}")),
        None => Ok(()),
    }
}

/// Splits a receipt file into stream messages. An empty file yields no messages, which
/// the server answers with `EMPTY_PAYLOAD`.
pub fn chunk_payload(bytes: &[u8]) -> Vec<CreateExpenseRequest> {
    bytes
        .chunks(UPLOAD_CHUNK_BYTES)
        .map(|chunk| CreateExpenseRequest {
            chunks: chunk.to_vec(),
        })
        .collect()
}

pub fn bearer_value(token: &str) -> Result<MetadataValue<Ascii>, String> {
    let token = token.trim();
    if token.is_empty() {
        return Err("auth token must not be empty (use --token or EXPENSES_TOKEN)".to_string());
    }
    let header = if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    };
    header
        .parse::<MetadataValue<Ascii>>()
        .map_err(|_| "auth token contains characters not allowed in metadata".to_string())
}

pub async fn execute_command(
    server_addr: &str,
    command: CliCommand,
    password: Option<String>,
) -> Result<String, String> {
    match command {
        CliCommand::CreateUser {
            username,
            email,
            first_name,
            last_name,
        } => {
            let password = password.ok_or_else(|| "password required".to_string())?;
            let mut client = users_client(server_addr).await?;
            let out = client
                .create_user(CreateUserRequest {
                    username,
                    email,
                    first_name,
                    last_name,
                    password,
                })
                .await
                .map_err(|s| format!("create-user failed: {}", s.message()))?
                .into_inner();
            Ok(format!(
                "{}\nuser_id={}\nauth_token={}",
                out.message, out.user_id, out.auth_token
            ))
        }
        CliCommand::Login { username } => {
            let password = password.ok_or_else(|| "password required".to_string())?;
            let mut client = users_client(server_addr).await?;
            let out = client
                .get_user(GetUserRequest {
                    user_id: String::new(),
                    username,
                    password,
                })
                .await
                .map_err(|s| format!("login failed: {}", s.message()))?
                .into_inner();
            Ok(format!("user_id={}\nauth_token={}", out.user_id, out.auth_token))
        }
        CliCommand::Check { token } => {
            let mut client = users_client(server_addr).await?;
            let out = client
                .check_auth_token(CheckAuthTokenRequest { auth_token: token })
                .await
                .map_err(|s| format!("check failed: {}", s.message()))?
                .into_inner();
            if out.is_valid {
                Ok(format!("VALID user_id={}", out.user_id))
            } else {
                Ok(format!("INVALID {}", out.message))
            }
        }
        CliCommand::Upload { path, token } => {
            let token = token.ok_or_else(|| {
                "auth token required (use --token or EXPENSES_TOKEN)".to_string()
            })?;
            let authorization = bearer_value(&token)?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            let chunks = chunk_payload(&bytes);
            tracing::debug!(
                path = %path.display(),
                bytes = bytes.len(),
                chunks = chunks.len(),
                "uploading receipt"
            );

            let mut request = tonic::Request::new(tokio_stream::iter(chunks));
            request
                .metadata_mut()
                .insert("authorization", authorization);
            let mut client = ExpensesServiceClient::connect(server_addr.to_string())
                .await
                .map_err(|e| format!("failed to connect to {server_addr}: {e}"))?;
            let out = client
                .create_expense(request)
                .await
                .map_err(|s| format!("upload failed: {}", s.message()))?
                .into_inner();
            let mut text = out.status;
            if out.persisted {
                text.push_str(&format!("\npersisted expense_id={}", out.expense_id));
            } else {
                text.push_str("\nnot persisted");
            }
            Ok(text)
        }
    }
}

async fn users_client(
    server_addr: &str,
) -> Result<UsersServiceClient<tonic::transport::Channel>, String> {
    UsersServiceClient::connect(server_addr.to_string())
        .await
        .map_err(|e| format!("failed to connect to {server_addr}: {e}"))
}
