#![forbid(unsafe_code)]

use expenses_adapter::grpc_api::{
    expenses_service_server::{ExpensesService, ExpensesServiceServer},
    users_service_server::{UsersService, UsersServiceServer},
    CheckAuthTokenRequest, CheckAuthTokenResponse, CreateExpenseRequest, CreateExpenseResponse,
    CreateUserRequest, CreateUserResponse, GetUserRequest, GetUserResponse,
};
use expenses_adapter::{
    init_tracing, AdapterConfig, AdapterRuntime, GetUserAdapterRequest, GrpcChunkSource,
    GRPC_MAX_MESSAGE_BYTES,
};
use expenses_contracts::auth::NewAccount;
use tonic::metadata::MetadataMap;
use tonic::{transport::Server, Request, Response, Status, Streaming};

#[derive(Clone)]
struct GrpcExpenses {
    runtime: AdapterRuntime,
}

#[tonic::async_trait]
impl ExpensesService for GrpcExpenses {
    async fn create_expense(
        &self,
        request: Request<Streaming<CreateExpenseRequest>>,
    ) -> Result<Response<CreateExpenseResponse>, Status> {
        let authorization = bearer_from_metadata(request.metadata());
        let mut source = GrpcChunkSource::new(request.into_inner());
        match self
            .runtime
            .create_expense(authorization.as_deref(), &mut source)
            .await
        {
            Ok(out) => Ok(Response::new(CreateExpenseResponse {
                status: out.response,
                persisted: out.persisted,
                expense_id: out.expense_id.unwrap_or_default(),
                reason_code: out.reason_code,
            })),
            Err(err) => Err(err.grpc_status()),
        }
    }
}

#[tonic::async_trait]
impl UsersService for GrpcExpenses {
    async fn create_user(
        &self,
        request: Request<CreateUserRequest>,
    ) -> Result<Response<CreateUserResponse>, Status> {
        let req = request.into_inner();
        let account = NewAccount {
            username: req.username,
            email: req.email,
            first_name: req.first_name,
            last_name: req.last_name,
            password: req.password,
        };
        let out = self
            .runtime
            .create_user(account)
            .await
            .map_err(|err| err.grpc_status())?;
        Ok(Response::new(CreateUserResponse {
            message: out.message,
            user_id: out.user_id,
            auth_token: out.auth_token,
        }))
    }

    async fn get_user(
        &self,
        request: Request<GetUserRequest>,
    ) -> Result<Response<GetUserResponse>, Status> {
        let req = request.into_inner();
        let out = self
            .runtime
            .get_user(GetUserAdapterRequest {
                user_id: optional_string(req.user_id),
                username: optional_string(req.username),
                password: optional_string(req.password),
            })
            .await
            .map_err(|err| err.grpc_status())?;
        Ok(Response::new(GetUserResponse {
            user_id: out.user_id,
            username: out.username,
            email: out.email,
            first_name: out.first_name,
            last_name: out.last_name,
            auth_token: out.auth_token.unwrap_or_default(),
        }))
    }

    async fn check_auth_token(
        &self,
        request: Request<CheckAuthTokenRequest>,
    ) -> Result<Response<CheckAuthTokenResponse>, Status> {
        let req = request.into_inner();
        let out = self
            .runtime
            .check_auth_token(&req.auth_token)
            .await
            .map_err(|err| err.grpc_status())?;
        Ok(Response::new(CheckAuthTokenResponse {
            is_valid: out.is_valid,
            user_id: out.user_id.unwrap_or_default(),
            message: out.message,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = match AdapterConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(
                error = %err,
                kind = err.failure_kind().as_str(),
                reason_code = err.reason_code().0,
                "startup aborted"
            );
            return Err(err.into());
        }
    };
    let addr = config.grpc_bind.parse()?;
    let service = GrpcExpenses {
        runtime: AdapterRuntime::from_config(&config).await?,
    };

    tracing::info!(%addr, "expenses_adapter_grpc listening");
    Server::builder()
        .add_service(
            ExpensesServiceServer::new(service.clone())
                .max_decoding_message_size(GRPC_MAX_MESSAGE_BYTES),
        )
        .add_service(UsersServiceServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn bearer_from_metadata(metadata: &MetadataMap) -> Option<String> {
    metadata
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

fn optional_string(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
