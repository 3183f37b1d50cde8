use std::sync::{Arc, Mutex, PoisonError};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use travelbook::api::{ChangePasswordRequest, ProfileUpdate, RegisterRequest};
use travelbook::{
    ApiRequest, AuthOutcome, ClientConfig, ClientError, FileStore, Guard, GuardDecision, Navigator, RedirectReason,
    Session, SessionState,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("not signed in; run `travelbook login` first")]
    NotSignedIn,
    #[error("{0}")]
    Rejected(String),
    #[error("nothing to update; pass at least one field")]
    EmptyUpdate,
}

#[derive(Parser, Debug)]
#[command(name = "travelbook", about = "TravelBook account and API CLI")]
struct Cli {
    /// Overrides `TRAVELBOOK_API_URL`.
    #[arg(long)]
    api_url: Option<String>,

    /// Route the CLI pretends to be on, for redirect decisions.
    #[arg(long, default_value = "/")]
    at: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore the stored session and print who is signed in.
    Status,
    Login(LoginArgs),
    Register(RegisterArgs),
    Logout,
    /// Fetch the profile from the backend.
    Profile,
    UpdateProfile(UpdateProfileArgs),
    ChangePassword(ChangePasswordArgs),
    /// Evaluate a route guard for a path.
    Guard {
        #[arg(value_enum)]
        guard: GuardArg,
        path: String,
    },
    /// Send an authenticated request through the refresh pipeline.
    Request(RequestArgs),
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long)]
    email: String,
    #[arg(long, env = "TRAVELBOOK_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    email: String,
    #[arg(long, env = "TRAVELBOOK_PASSWORD", hide_env_values = true)]
    password: String,
    /// Confirmation; defaults to `--password`.
    #[arg(long)]
    password2: Option<String>,
    #[arg(long, default_value = "")]
    first_name: String,
    #[arg(long, default_value = "")]
    last_name: String,
    #[arg(long, default_value = "")]
    phone: String,
}

#[derive(Args, Debug)]
struct UpdateProfileArgs {
    #[arg(long)]
    first_name: Option<String>,
    #[arg(long)]
    last_name: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Args, Debug)]
struct ChangePasswordArgs {
    #[arg(long)]
    old_password: String,
    #[arg(long)]
    new_password: String,
}

#[derive(Args, Debug)]
struct RequestArgs {
    method: String,
    /// Path below the API base URL, e.g. `/bookings/bookings/my_bookings/`.
    path: String,
    #[arg(long)]
    data: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum GuardArg {
    Public,
    Authenticated,
    Admin,
}

impl From<GuardArg> for Guard {
    fn from(arg: GuardArg) -> Self {
        match arg {
            GuardArg::Public => Self::PublicOnly,
            GuardArg::Authenticated => Self::AuthenticatedOnly,
            GuardArg::Admin => Self::AdminOnly,
        }
    }
}

/// Reports redirects on stderr and tracks where the CLI "is".
struct CliNavigator {
    current: Mutex<String>,
}

impl Navigator for CliNavigator {
    fn current_path(&self) -> String {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn redirect(&self, path: &str, reason: RedirectReason) {
        eprintln!("redirect -> {path} ({reason:?})");
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = path.to_owned();
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    tracing::debug!(api_url = %config.api_url, token_file = %config.token_file.display(), "cli config");

    let store = Arc::new(FileStore::open(&config.token_file));
    let navigator = Arc::new(CliNavigator { current: Mutex::new(cli.at) });
    let session = Session::from_config(&config, store, navigator)?;
    session.check_auth().await;

    match cli.command {
        Command::Status => run_status(&session),
        Command::Login(args) => report(session.login(&args.email, &args.password).await),
        Command::Register(args) => run_register(&session, args).await,
        Command::Logout => {
            session.logout().await;
            println!("signed out");
            Ok(())
        }
        Command::Profile => run_profile(&session).await,
        Command::UpdateProfile(args) => run_update_profile(&session, args).await,
        Command::ChangePassword(args) => run_change_password(&session, args).await,
        Command::Guard { guard, path } => run_guard(&session, guard.into(), &path),
        Command::Request(args) => run_request(&session, args).await,
    }
}

fn run_status(session: &Session) -> Result<(), CliError> {
    match session.state() {
        SessionState::Authenticated(user) => {
            println!("signed in as {} <{}> ({:?})", user.full_name(), user.email, user.role);
        }
        SessionState::Anonymous | SessionState::Initializing => println!("signed out"),
    }
    Ok(())
}

async fn run_register(session: &Session, args: RegisterArgs) -> Result<(), CliError> {
    let password2 = args.password2.unwrap_or_else(|| args.password.clone());
    let fields = RegisterRequest {
        email: args.email,
        password: args.password,
        password2,
        first_name: args.first_name,
        last_name: args.last_name,
        phone: args.phone,
    };
    report(session.register(&fields).await)
}

async fn run_profile(session: &Session) -> Result<(), CliError> {
    if !session.is_authenticated() {
        return Err(CliError::NotSignedIn);
    }
    let user = session.fetch_profile().await?;
    print_json(&serde_json::to_value(&user)?)
}

async fn run_update_profile(session: &Session, args: UpdateProfileArgs) -> Result<(), CliError> {
    let fields = ProfileUpdate {
        first_name: args.first_name,
        last_name: args.last_name,
        phone: args.phone,
        ..ProfileUpdate::default()
    };
    if fields.is_empty() {
        return Err(CliError::EmptyUpdate);
    }
    report(session.update_profile(&fields).await)
}

async fn run_change_password(session: &Session, args: ChangePasswordArgs) -> Result<(), CliError> {
    let request = ChangePasswordRequest {
        old_password: args.old_password,
        new_password2: args.new_password.clone(),
        new_password: args.new_password,
    };
    report(session.change_password(&request).await)
}

fn run_guard(session: &Session, guard: Guard, path: &str) -> Result<(), CliError> {
    match session.guard(guard, path) {
        GuardDecision::Wait => println!("wait"),
        GuardDecision::Allow => println!("allow"),
        GuardDecision::AccessDenied => println!("access denied"),
        GuardDecision::Redirect { to, return_to, reason } => match return_to {
            Some(from) => println!("redirect {to} ({reason:?}), return to {from}"),
            None => println!("redirect {to} ({reason:?})"),
        },
    }
    Ok(())
}

async fn run_request(session: &Session, args: RequestArgs) -> Result<(), CliError> {
    let method = reqwest::Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| CliError::InvalidMethod(args.method.clone()))?;
    let mut request = ApiRequest::new(method, args.path);
    if let Some(data) = args.data {
        request = request.with_body(serde_json::from_str::<Value>(&data)?);
    }

    let response = session.client().send(request).await?;
    eprintln!("HTTP {}", response.status);
    print_json(&response.body)
}

fn report(outcome: AuthOutcome) -> Result<(), CliError> {
    if outcome.success {
        if !outcome.message.is_empty() {
            println!("{}", outcome.message);
        }
        Ok(())
    } else {
        Err(CliError::Rejected(outcome.message))
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
