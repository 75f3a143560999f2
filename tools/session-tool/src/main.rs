use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use session_keys::{
    abi::{selector_of, AbiRegistry},
    config::{self, Config},
    policy::{address_word, uint_word, ArgumentRef, ArgumentRule, Permission, PermissionRule, RuleValue},
    Account, AgentSession, ApprovalArtifact, Call, CallPolicy, DecodedApproval, Gateway, InMemoryChain,
    LocalSigner, OwnerSessions, Policy, SessionError, SessionValidator, Signer, Verdict,
};
use session_policy_types::Comparand;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Session-key operator tooling: generate keys, validate policies, inspect approval
/// artifacts and rehearse the owner/agent lifecycle locally.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a session key and write it to a JSON file.
    Keygen {
        #[arg(long, default_value = "session-key.json")]
        out: PathBuf,

        /// Replace an existing key file.
        #[arg(long)]
        force: bool,
    },

    /// Validate a JSON policy file and print the resolved permissions.
    Policy(PolicyArgs),

    /// Decode an approval artifact and verify its owner signature.
    Inspect(ArtifactArgs),

    /// Evaluate one call against the policies carried by an approval artifact.
    Check {
        #[command(flatten)]
        artifact: ArtifactArgs,

        /// Call target.
        #[arg(long)]
        to: String,

        /// Hex call data, with or without `0x`.
        #[arg(long, default_value = "0x")]
        data: String,

        /// Native value in wei.
        #[arg(long, default_value = "0")]
        value: String,
    },

    /// Run propose, approve, execute and revoke against an in-memory ledger.
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct PolicyArgs {
    /// JSON array of permission rules.
    #[arg(long)]
    file: PathBuf,

    /// Register the ERC-20 `transfer/approve/transferFrom` ABI for a token.
    #[arg(long = "erc20", value_name = "TOKEN")]
    erc20: Vec<String>,

    /// Register a function ABI, eg `0xabc...=swap(uint256 amountIn, address to)`.
    #[arg(long = "abi", value_name = "TARGET=SIGNATURE")]
    abi: Vec<String>,

    /// Also derive the permission id for this session address.
    #[arg(long)]
    session: Option<String>,
}

#[derive(Args, Debug)]
struct ArtifactArgs {
    /// Base64 approval artifact.
    #[arg(long, conflicts_with = "artifact_file", required_unless_present = "artifact_file")]
    artifact: Option<String>,

    /// File containing the artifact.
    #[arg(long)]
    artifact_file: Option<PathBuf>,
}

impl ArtifactArgs {
    fn load(&self) -> Result<ApprovalArtifact> {
        let raw = match (&self.artifact, &self.artifact_file) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("failed reading {}", path.display()))?,
            (None, None) => bail!("provide --artifact or --artifact-file"),
        };
        Ok(raw.trim().parse()?)
    }
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, env = "RPC_URL")]
    rpc_url: Option<String>,

    /// Owner private key (hex string, 0x...).
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// ERC-20 token the demo session may transfer.
    #[arg(long, env = "TARGET_CONTRACT")]
    target_contract: Option<String>,

    #[arg(long, env = "CHAIN_ID")]
    chain_id: Option<String>,

    /// Per-transfer cap in base units.
    #[arg(long, default_value = "10000000000000000000")]
    cap: String,

    /// Session lifetime in seconds.
    #[arg(long, default_value_t = 3600)]
    ttl_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine; flags and exported variables still apply.
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Keygen { out, force } => keygen(&out, force),
        Command::Policy(args) => policy(&args),
        Command::Inspect(args) => {
            let decoded = args.load()?.decode()?;
            print_json(&describe_approval(&decoded))
        }
        Command::Check { artifact, to, data, value } => check(&artifact, &to, &data, &value),
        Command::Demo(args) => demo(&args).await,
    }
}

fn keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists (pass --force to replace it)", out.display());
    }
    let signer = LocalSigner::random();
    let doc = json!({
        "address": signer.address().to_string(),
        "private_key": signer.to_hex(),
        "created_at": now_rfc3339(),
    });
    write_json_atomic(out, &doc)?;
    println!("Session key {} written to {}", signer.address(), out.display());
    Ok(())
}

fn policy(args: &PolicyArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed reading {}", args.file.display()))?;
    let rules: Vec<PermissionRule> = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing rules in {}", args.file.display()))?;

    let mut registry = AbiRegistry::new();
    for token in &args.erc20 {
        registry.register_erc20(parse_address(token)?)?;
    }
    for entry in &args.abi {
        let (target, signature) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("expected TARGET=SIGNATURE, got `{entry}`"))?;
        registry.register(parse_address(target)?, signature)?;
    }

    let call_policy = CallPolicy::from_rules(&registry, &rules)?;
    let mut out = json!({
        "permissions": call_policy.permissions.iter().map(describe_permission).collect::<Vec<_>>(),
    });
    if let Some(session) = &args.session {
        let validator = SessionValidator::new(parse_address(session)?, vec![Policy::Call(call_policy)], None)?;
        out["permission_id"] = json!(validator.permission_id().to_string());
        out["validation_id"] = json!(validator.validation_id().to_string());
        out["policy_bytes"] = json!(format!("0x{}", hex::encode(validator.policy_bytes())));
    }
    print_json(&out)
}

fn check(artifact: &ArtifactArgs, to: &str, data: &str, value: &str) -> Result<()> {
    let decoded = artifact.load()?.decode()?;
    let data = hex::decode(data.trim().trim_start_matches("0x")).context("call data is not hex")?;
    let value: U256 = value.trim().parse().context("invalid value")?;
    let call = Call::new(parse_address(to)?, data).with_value(value);

    match decoded.session.evaluate(&call) {
        Verdict::Allow => print_json(&json!({ "verdict": "allow" })),
        Verdict::Deny(reason) => {
            print_json(&json!({ "verdict": "deny", "reason": reason.to_string() }))?;
            bail!("call denied: {reason}")
        }
    }
}

async fn demo(args: &DemoArgs) -> Result<()> {
    let config = Config::from_lookup(|key| match key {
        config::RPC_URL => args.rpc_url.clone(),
        config::PRIVATE_KEY => args.private_key.clone(),
        config::TARGET_CONTRACT => args.target_contract.clone(),
        config::CHAIN_ID => args.chain_id.clone(),
        other => std::env::var(other).ok(),
    })
    .context("invalid configuration")?;
    info!(?config, "loaded configuration");

    let token = config.target_contract;
    let cap: U256 = args.cap.parse().context("invalid --cap")?;
    let timeout = config.receipt_timeout;

    // The owner and the agent share only the ledger and the artifact.
    let chain = Arc::new(InMemoryChain::new(config.chain_id));
    chain.register_account(config.owner(), config.owner());
    let gateway = Gateway::new(chain.clone(), chain.clone(), chain.clone())
        .with_poll_interval(config.receipt_poll.min(Duration::from_millis(50)));
    let account = Account::create(config.owner_signer(), config.chain_id, config.entry_point, config.kernel);
    let owner = OwnerSessions::new(account, gateway.clone())?;

    let mut registry = AbiRegistry::new();
    registry.register_erc20(token)?;
    let rules = [PermissionRule {
        target: token,
        function: "transfer".into(),
        args: vec![
            ArgumentRule {
                arg: ArgumentRef::Name("to".into()),
                condition: "NOT_EQUAL".into(),
                value: RuleValue::Single(Address::ZERO.to_string()),
            },
            ArgumentRule {
                arg: ArgumentRef::Name("amount".into()),
                condition: "LESS_THAN_OR_EQUAL".into(),
                value: RuleValue::Single(cap.to_string()),
            },
        ],
        value_limit: Some("0".into()),
    }];
    let policy = Policy::Call(CallPolicy::from_rules(&registry, &rules)?);

    let session_key = Arc::new(LocalSigner::random());
    let valid_until = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64 + args.ttl_secs;
    let mut handle = owner.propose(session_key.address(), vec![policy], Some(valid_until))?;
    let artifact = owner.approve(&mut handle, timeout).await?;

    let mut agent = AgentSession::activate(&artifact, session_key.clone(), gateway.clone())?;
    let recipient = session_key.address();
    let receipt = agent.execute(vec![transfer(token, recipient, cap)], timeout).await?;

    let over_cap = agent
        .execute(vec![transfer(token, recipient, cap.saturating_add(U256::from(1u8)))], timeout)
        .await;
    let over_cap = expect_refusal(over_cap, "over-cap transfer")?;

    let revoked = owner.revoke_session(&mut handle, timeout).await?;
    let after_revoke = agent.execute(vec![transfer(token, recipient, U256::from(1u8))], timeout).await;
    let after_revoke = expect_refusal(after_revoke, "transfer after revoke")?;

    print_json(&json!({
        "account": config.owner().to_string(),
        "session": session_key.address().to_string(),
        "artifact": artifact.as_str(),
        "transfer": { "op": receipt.hash.to_string(), "block": receipt.block_number },
        "over_cap": over_cap,
        "revoked": format!("{revoked:?}"),
        "after_revoke": after_revoke,
        "executed_calls": chain.executed_calls().len(),
    }))
}

fn expect_refusal<T>(outcome: Result<T, SessionError>, what: &str) -> Result<String> {
    match outcome {
        Ok(_) => bail!("{what} unexpectedly succeeded"),
        Err(err) => {
            warn!(error = %err, "{what} refused");
            Ok(err.to_string())
        }
    }
}

fn transfer(token: Address, to: Address, amount: U256) -> Call {
    let mut data = selector_of("transfer(address,uint256)").to_vec();
    data.extend_from_slice(address_word(to).as_slice());
    data.extend_from_slice(uint_word(amount).as_slice());
    Call::new(token, data)
}

fn describe_approval(decoded: &DecodedApproval) -> Value {
    let session = &decoded.session;
    json!({
        "version": decoded.version,
        "entry_point": decoded.entry_point.as_str(),
        "kernel": decoded.kernel.as_str(),
        "chain_id": decoded.chain_id,
        "account": decoded.account.to_string(),
        "owner": decoded.owner.to_string(),
        "session": session.session().to_string(),
        "permission_id": session.permission_id().to_string(),
        "validation_id": session.validation_id().to_string(),
        "valid_until": session.valid_until().map(format_timestamp),
        "policies": session.policies().iter().map(describe_policy).collect::<Vec<_>>(),
    })
}

fn describe_policy(policy: &Policy) -> Value {
    match policy {
        Policy::Sudo => json!("sudo"),
        Policy::Call(call_policy) => json!({
            "permissions": call_policy.permissions.iter().map(describe_permission).collect::<Vec<_>>(),
        }),
    }
}

fn describe_permission(permission: &Permission) -> Value {
    let conditions: Vec<Value> = permission
        .conditions
        .iter()
        .map(|c| {
            let value = match c.comparand {
                Comparand::Word(word) => json!(word.to_string()),
                Comparand::Range { min, max } => json!([min.to_string(), max.to_string()]),
            };
            json!({ "arg": c.index, "type": c.param.to_string(), "condition": c.condition.as_str(), "value": value })
        })
        .collect();
    json!({
        "target": permission.target.to_string(),
        "function": permission.function.canonical(),
        "selector": permission.function.selector.to_string(),
        "value_limit": permission.value_limit.map(|v| v.to_string()),
        "conditions": conditions,
    })
}

fn parse_address(raw: &str) -> Result<Address> {
    raw.trim().parse().with_context(|| format!("invalid address `{raw}`"))
}

fn format_timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    if !parent.as_os_str().is_empty() && !parent.exists() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating directory {}", parent.display()))?;
    }

    let serialised = serde_json::to_string_pretty(value).context("failed serialising JSON")?;
    let tmp_path = tmp_path_for(path);
    match fs::remove_file(&tmp_path) {
        Err(err) if err.kind() != ErrorKind::NotFound => {
            return Err(err).with_context(|| format!("failed removing stale {}", tmp_path.display()));
        }
        _ => {}
    }

    // The document carries a private key; keep it owner-only from the first byte.
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    let mut file = options
        .open(&tmp_path)
        .with_context(|| format!("failed creating temp file {}", tmp_path.display()))?;
    file.write_all(serialised.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed writing temp file {}", tmp_path.display()))?;
    drop(file);
    fs::rename(&tmp_path, path).with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn key_files_are_owner_only() {
        let dir = std::env::temp_dir().join(format!("session-tool-keygen-{}", std::process::id()));
        let path = dir.join("session.json");
        // A stale temp file with wide permissions must not leak its mode.
        fs::create_dir_all(&dir).unwrap();
        fs::write(tmp_path_for(&path), b"{}").unwrap();
        fs::set_permissions(tmp_path_for(&path), fs::Permissions::from_mode(0o644)).unwrap();

        write_json_atomic(&path, &json!({ "private_key": "0x01" })).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(!tmp_path_for(&path).exists());
        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["private_key"], "0x01");
        fs::remove_dir_all(&dir).unwrap();
    }
}
