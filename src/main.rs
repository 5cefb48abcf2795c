use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use carbon_governance::{
    auth::parse_account, store, Command, CommandOutcome, Deployment, Error, GovernanceConfig,
    Identity, PostVerificationPolicy, ProjectId, SignedCommand, Settings,
};

//==================== arguments ====================//

#[derive(Parser, Debug)]
#[command(
    name = "cgov",
    version,
    about = "Carbon credit ledger and token-weighted project verification"
)]
struct Cli {
    #[arg(long, global = true, help = "JSON settings file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "State file (overrides settings and CGOV_STATE)")]
    state: Option<PathBuf>,
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a keypair: <out-dir>/sk.hex and <out-dir>/account.hex
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Create a new state file administered by the given key
    Init {
        #[arg(long)]
        admin_key: PathBuf,
        #[arg(long)]
        quorum: Option<u64>,
        #[arg(long, help = "accept | reject")]
        post_verification: Option<PostVerificationPolicy>,
    },
    /// Submit a project for verification
    Submit {
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        details: String,
    },
    /// Verify a project directly (administrator only)
    Verify {
        #[arg(long)]
        key: PathBuf,
        project_id: ProjectId,
    },
    /// Issue credits to an account (administrator only)
    Mint {
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        to: String,
        amount: u64,
    },
    /// Destroy credits from your own balance
    Burn {
        #[arg(long)]
        key: PathBuf,
        amount: u64,
    },
    /// Move credits to another account
    Transfer {
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        to: String,
        amount: u64,
    },
    /// Vote for a project
    Vote {
        #[arg(long)]
        key: PathBuf,
        project_id: ProjectId,
    },
    /// Show an account balance
    Balance { account: String },
    /// Show a project record
    Project { project_id: ProjectId },
    /// Show the affirmative vote count of a project
    Tally { project_id: ProjectId },
    /// Print the audit log
    Audit,
    /// Sign a command without applying it
    Sign {
        #[arg(long)]
        key: PathBuf,
        #[arg(long, help = "Command as JSON, e.g. {\"type\":\"vote\",\"project_id\":1}")]
        command: String,
        #[arg(long, help = "Defaults to the next nonce recorded in the state file")]
        nonce: Option<u64>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Apply a signed command envelope
    Apply { envelope: PathBuf },
    /// Run the mint / submit / verify / vote walkthrough in memory
    Demo,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] Error),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    fn kind(&self) -> String {
        match self {
            CliError::Core(err) => err.kind().to_string(),
            CliError::Io { .. } => "io".to_string(),
            CliError::Json(_) => "malformed_input".to_string(),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CliError + '_ {
    move |source| CliError::Io {
        path: path.to_path_buf(),
        source,
    }
}

//==================== helpers ====================//

fn load_identity(path: &Path) -> Result<Identity, CliError> {
    let secret = fs::read_to_string(path).map_err(io_error(path))?;
    Ok(Identity::from_secret_hex(&secret).map_err(Error::from)?)
}

fn load_deployment(settings: &Settings) -> Result<Deployment, CliError> {
    Ok(store::load(&settings.state_path).map_err(Error::from)?)
}

fn save_deployment(settings: &Settings, deployment: &Deployment) -> Result<(), CliError> {
    Ok(store::save(&settings.state_path, deployment).map_err(Error::from)?)
}

fn emit<T: Serialize>(
    json: bool,
    value: &T,
    human: impl FnOnce() -> String,
) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}

fn describe(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::ProjectSubmitted { project_id } => {
            format!("project {project_id} submitted")
        }
        CommandOutcome::ProjectVerified { project_id, changed } => {
            if *changed {
                format!("project {project_id} verified")
            } else {
                format!("project {project_id} was already verified")
            }
        }
        CommandOutcome::Minted { to, amount, balance } => {
            format!("minted {amount} to {to} (balance {balance})")
        }
        CommandOutcome::Burned { amount, balance } => {
            format!("burned {amount} (balance {balance})")
        }
        CommandOutcome::Transferred { to, amount, balance } => {
            format!("transferred {amount} to {to} (balance {balance})")
        }
        CommandOutcome::Voted(vote) => {
            let mut line = format!("voted for project {} (tally {})", vote.project, vote.tally);
            if vote.crossed_threshold {
                line.push_str(", project verified");
            }
            line
        }
    }
}

/// Hold the state file lock across a load, mutate and save cycle.
fn with_state_lock<T>(
    settings: &Settings,
    f: impl FnOnce() -> Result<T, CliError>,
) -> Result<T, CliError> {
    store::locked(&settings.state_path, f).map_err(Error::from)?
}

/// Sign `command` with the key at `key` using the next nonce and apply it.
fn run_signed(
    settings: &Settings,
    json: bool,
    key: &Path,
    command: Command,
) -> Result<(), CliError> {
    let identity = load_identity(key)?;
    let outcome = with_state_lock(settings, || {
        let deployment = load_deployment(settings)?;
        let nonce = deployment.next_nonce(&identity.account_id());
        let envelope = identity.sign(nonce, command);
        apply_envelope(settings, &deployment, &envelope)
    })?;
    emit(json, &outcome, || describe(&outcome))
}

/// Must be called with the state lock held.
fn apply_envelope(
    settings: &Settings,
    deployment: &Deployment,
    envelope: &SignedCommand,
) -> Result<CommandOutcome, CliError> {
    let outcome = deployment.execute(envelope)?;
    save_deployment(settings, deployment)?;
    Ok(outcome)
}

//==================== commands ====================//

fn keygen_cmd(json: bool, out_dir: &Path) -> Result<(), CliError> {
    fs::create_dir_all(out_dir).map_err(io_error(out_dir))?;
    let identity = Identity::generate();
    let account = identity.account_id();

    let sk_path = out_dir.join("sk.hex");
    if sk_path.exists() {
        return Err(CliError::Io {
            path: sk_path,
            source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "key already exists"),
        });
    }
    fs::write(&sk_path, identity.secret_hex()).map_err(io_error(&sk_path))?;
    let account_path = out_dir.join("account.hex");
    fs::write(&account_path, &account).map_err(io_error(&account_path))?;

    emit(json, &serde_json::json!({ "account": account }), || {
        format!("keypair written → {} (account {account})", out_dir.display())
    })
}

fn init_cmd(
    settings: &Settings,
    json: bool,
    admin_key: &Path,
    quorum: Option<u64>,
    policy: Option<PostVerificationPolicy>,
) -> Result<(), CliError> {
    let admin = load_identity(admin_key)?;
    let mut config = match quorum {
        Some(q) => GovernanceConfig::with_quorum(q).map_err(Error::from)?,
        None => settings.governance.clone(),
    };
    if let Some(policy) = policy {
        config = config.post_verification(policy);
    }
    let deployment = Deployment::new(&admin.caller(), config);
    with_state_lock(settings, || {
        Ok(store::create(&settings.state_path, &deployment).map_err(Error::from)?)
    })?;
    info!(state = %settings.state_path.display(), "state file created");

    let summary = serde_json::json!({
        "admin": deployment.admin(),
        "quorum": deployment.config().quorum(),
        "post_verification": deployment.config().post_verification,
        "state": settings.state_path,
    });
    emit(json, &summary, || {
        format!(
            "initialised {} (admin {}, quorum {})",
            settings.state_path.display(),
            deployment.admin(),
            deployment.config().quorum()
        )
    })
}

fn balance_cmd(settings: &Settings, json: bool, account: &str) -> Result<(), CliError> {
    let account = parse_account(account).map_err(Error::from)?;
    let deployment = load_deployment(settings)?;
    let balance = deployment.balance_of(&account);
    emit(
        json,
        &serde_json::json!({ "account": account, "balance": balance }),
        || format!("{account}: {balance}"),
    )
}

fn project_cmd(settings: &Settings, json: bool, project_id: ProjectId) -> Result<(), CliError> {
    let deployment = load_deployment(settings)?;
    let record = deployment.projects(project_id)?;
    emit(json, &record, || {
        format!(
            "project {}: {}\n  details:   {}\n  submitter: {}\n  verified:  {}",
            record.id, record.name, record.details, record.submitter, record.verified
        )
    })
}

fn tally_cmd(settings: &Settings, json: bool, project_id: ProjectId) -> Result<(), CliError> {
    let deployment = load_deployment(settings)?;
    let tally = deployment.tally(project_id)?;
    let quorum = deployment.config().quorum();
    emit(
        json,
        &serde_json::json!({ "project_id": project_id, "tally": tally, "quorum": quorum }),
        || format!("project {project_id}: {tally}/{quorum} votes"),
    )
}

fn audit_cmd(settings: &Settings, json: bool) -> Result<(), CliError> {
    let deployment = load_deployment(settings)?;
    let log = deployment.audit_log();
    emit(json, &log, || {
        log.iter()
            .map(|entry| format!("#{} {} {:?}", entry.seq, entry.initiator, entry.action))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

fn sign_cmd(
    settings: &Settings,
    json: bool,
    key: &Path,
    command: &str,
    nonce: Option<u64>,
    out: Option<&Path>,
) -> Result<(), CliError> {
    let identity = load_identity(key)?;
    let command: Command = serde_json::from_str(command)?;
    let nonce = match nonce {
        Some(nonce) => nonce,
        None => load_deployment(settings)?.next_nonce(&identity.account_id()),
    };
    let envelope = identity.sign(nonce, command);
    let encoded = serde_json::to_string_pretty(&envelope)?;
    match out {
        Some(path) => {
            fs::write(path, &encoded).map_err(io_error(path))?;
            emit(json, &serde_json::json!({ "envelope": path }), || {
                format!("signed envelope written → {}", path.display())
            })
        }
        None => {
            println!("{encoded}");
            Ok(())
        }
    }
}

fn apply_cmd(settings: &Settings, json: bool, path: &Path) -> Result<(), CliError> {
    let raw = fs::read(path).map_err(io_error(path))?;
    let envelope: SignedCommand = serde_json::from_slice(&raw)?;
    let outcome = with_state_lock(settings, || {
        let deployment = load_deployment(settings)?;
        apply_envelope(settings, &deployment, &envelope)
    })?;
    emit(json, &outcome, || describe(&outcome))
}

/// Mint, submit, verify directly, vote and read back, then verify a second
/// project purely by votes.
fn demo_cmd(settings: &Settings, json: bool) -> Result<(), CliError> {
    let owner = Identity::generate();
    let voters: Vec<Identity> = (0..settings.governance.quorum().min(16))
        .map(|_| Identity::generate())
        .collect();
    let deployment = Deployment::new(&owner.caller(), settings.governance.clone());
    let mut steps: Vec<String> = Vec::new();

    let first = &voters[0];
    deployment.mint(&owner.caller(), &first.account_id(), 100)?;
    steps.push("Minted 100 credits to account 1".into());
    steps.push(format!(
        "Balance of account 1: {}",
        deployment.balance_of(&first.account_id())
    ));

    let direct = deployment.submit_project(&first.caller(), "Project 1", "Details 1")?;
    steps.push(format!("Submitted project {direct}"));
    deployment.verify_project(&owner.caller(), direct)?;
    steps.push(format!("Verified project {direct}"));
    match deployment.vote_for_project(&first.caller(), direct) {
        Ok(outcome) => steps.push(format!(
            "Voted for project {direct} (tally {})",
            outcome.tally
        )),
        Err(err) => steps.push(format!("Vote for project {direct} rejected: {}", err.kind())),
    }
    steps.push(format!(
        "Project {direct} verified: {}",
        deployment.projects(direct)?.verified
    ));

    let voted = deployment.submit_project(&first.caller(), "Project 2", "Details 2")?;
    steps.push(format!("Submitted project {voted}"));
    for (idx, voter) in voters.iter().enumerate() {
        if deployment.balance_of(&voter.account_id()) == 0 {
            deployment.mint(&owner.caller(), &voter.account_id(), 100)?;
        }
        let outcome = deployment.vote_for_project(&voter.caller(), voted)?;
        steps.push(format!(
            "Account {} voted for project {voted} (tally {}{})",
            idx + 1,
            outcome.tally,
            if outcome.crossed_threshold { ", verified" } else { "" }
        ));
    }
    steps.push(format!(
        "Project {voted} verified: {}",
        deployment.projects(voted)?.verified
    ));

    emit(json, &steps, || steps.join("\n"))
}

//==================== main ====================//

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli, settings: Settings) -> Result<(), CliError> {
    let json = cli.json;
    match cli.command {
        Commands::Keygen { out_dir } => keygen_cmd(json, &out_dir),
        Commands::Init {
            admin_key,
            quorum,
            post_verification,
        } => init_cmd(&settings, json, &admin_key, quorum, post_verification),
        Commands::Submit { key, name, details } => run_signed(
            &settings,
            json,
            &key,
            Command::SubmitProject { name, details },
        ),
        Commands::Verify { key, project_id } => {
            run_signed(&settings, json, &key, Command::VerifyProject { project_id })
        }
        Commands::Mint { key, to, amount } => {
            run_signed(&settings, json, &key, Command::Mint { to, amount })
        }
        Commands::Burn { key, amount } => run_signed(&settings, json, &key, Command::Burn { amount }),
        Commands::Transfer { key, to, amount } => {
            run_signed(&settings, json, &key, Command::Transfer { to, amount })
        }
        Commands::Vote { key, project_id } => {
            run_signed(&settings, json, &key, Command::Vote { project_id })
        }
        Commands::Balance { account } => balance_cmd(&settings, json, &account),
        Commands::Project { project_id } => project_cmd(&settings, json, project_id),
        Commands::Tally { project_id } => tally_cmd(&settings, json, project_id),
        Commands::Audit => audit_cmd(&settings, json),
        Commands::Sign {
            key,
            command,
            nonce,
            out,
        } => sign_cmd(&settings, json, &key, &command, nonce, out.as_deref()),
        Commands::Apply { envelope } => apply_cmd(&settings, json, &envelope),
        Commands::Demo => demo_cmd(&settings, json),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error[invalid_config]: {err}");
            return ExitCode::from(2);
        }
    };
    if let Some(state) = &cli.state {
        settings.state_path = state.clone();
    }
    init_tracing(&settings.log_filter);

    match run(cli, settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {err}", err.kind());
            ExitCode::FAILURE
        }
    }
}
