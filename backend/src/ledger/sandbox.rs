//! In-process ledger backed by the Soroban host.
//!
//! The host environment is single-threaded, so it lives on its own OS thread
//! and is driven by [`Command`] messages. The [`LedgerGateway`] impl turns
//! each call into a command and awaits the reply.
//!
//! Submitted transactions are applied lazily: a hash stays `NOT_FOUND` for
//! the configured number of status queries, then the contract call runs and
//! its outcome becomes the final `SUCCESS` or `FAILED` record.
//!
//! Every boot takes a fresh [`boot_ledger`], and accounts start at
//! `boot_ledger << 32` the way the network seeds new accounts, so a restarted
//! sandbox never reissues a transaction hash from an earlier run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::thread;

use async_trait::async_trait;
use proof_of_service::{ContractError, ProofOfService, ProofOfServiceClient};
use sha2::{Digest, Sha256};
use soroban_sdk::testutils::{EnvTestConfig, Ledger as _};
use soroban_sdk::{Address, Bytes, BytesN, Env, InvokeError, String as SorobanString, Symbol};
use stellar_strkey::Strkey;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::signer::{self, Signer, SignerError};
use super::{
    transaction_hash, unix_now, Account, GatewayError, LedgerGateway, PreparedTransaction,
    ResourceEstimate, ScVal, SendResponse, SendStatus, SignedTransaction, Simulation,
    TransactionMeta, TransactionResponse, TxStatus, UnsignedTransaction,
};

/// 2024-01-01T00:00:00Z. Boot ledgers count seconds from here.
const SANDBOX_EPOCH: u64 = 1_704_067_200;
const BASE_INSTRUCTIONS: u64 = 1_500_000;
const RESOURCE_FEE_FLOOR: i64 = 10_000;
const FEE_PER_BYTE: i64 = 25;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub network_passphrase: String,
    pub contract_id: String,
    /// Secret of the contract admin. A key derived from the passphrase is
    /// used when absent.
    pub admin_secret: Option<String>,
    /// Accounts funded and allow-listed at startup.
    pub therapists: Vec<String>,
    /// Status queries answered with `NOT_FOUND` before a transaction applies.
    pub indexing_polls: u32,
    /// Ledger sequence the sandbox starts at; see [`boot_ledger`].
    pub first_ledger: u32,
}

static LAST_BOOT: AtomicU32 = AtomicU32::new(0);

/// A starting ledger no earlier boot has used: seconds since
/// [`SANDBOX_EPOCH`], bumped past any boot already taken in this process.
pub fn boot_ledger() -> u32 {
    let now = u32::try_from(unix_now().saturating_sub(SANDBOX_EPOCH))
        .unwrap_or(u32::MAX >> 1)
        .max(1);
    let previous = LAST_BOOT
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or(0);
    now.max(previous.saturating_add(1))
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("{0} is not a valid account address")]
    InvalidAddress(String),

    #[error("{0} is not a valid C... contract address")]
    InvalidContract(String),

    #[error("failed to start ledger thread: {0}")]
    Spawn(#[from] std::io::Error),
}

type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

enum Command {
    GetAccount(String, Reply<Account>),
    Simulate(UnsignedTransaction, Reply<Simulation>),
    Send(SignedTransaction, Reply<SendResponse>),
    GetTransaction(String, Reply<TransactionResponse>),
    SetTherapist(String, bool, Reply<()>),
    Fund(String, Reply<Account>),
}

/// Handle to the sandbox thread. Dropping the last handle stops the thread.
pub struct SandboxLedger {
    commands: mpsc::Sender<Command>,
    admin: String,
}

impl SandboxLedger {
    pub fn start(config: SandboxConfig) -> Result<Self, SandboxError> {
        let admin = match config.admin_secret.as_deref() {
            Some(secret) => Signer::from_secret(secret)?,
            None => Signer::from_seed(derive_seed(&config.network_passphrase, b"sandbox-admin")),
        };
        if stellar_strkey::Contract::from_string(&config.contract_id).is_err() {
            return Err(SandboxError::InvalidContract(config.contract_id.clone()));
        }
        for therapist in &config.therapists {
            if !is_account_address(therapist) {
                return Err(SandboxError::InvalidAddress(therapist.clone()));
            }
        }

        let (commands, inbox) = mpsc::channel();
        let admin_address = admin.address().to_string();
        thread::Builder::new()
            .name("ledger-sandbox".to_string())
            .spawn(move || run(config, admin_address, inbox))?;

        Ok(Self {
            commands,
            admin: admin.address().to_string(),
        })
    }

    pub fn admin(&self) -> &str {
        &self.admin
    }

    /// Add or remove an account from the contract's therapist allow-list.
    pub async fn set_therapist(&self, address: &str, active: bool) -> Result<(), GatewayError> {
        let address = address.to_string();
        self.request(|reply| Command::SetTherapist(address, active, reply))
            .await
    }

    /// Create the account if needed and return its current state.
    pub async fn fund(&self, address: &str) -> Result<Account, GatewayError> {
        let address = address.to_string();
        self.request(|reply| Command::Fund(address, reply)).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, GatewayError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| GatewayError::Unavailable)?;
        response.await.map_err(|_| GatewayError::Unavailable)?
    }
}

impl fmt::Debug for SandboxLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxLedger")
            .field("admin", &self.admin)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LedgerGateway for SandboxLedger {
    async fn get_account(&self, address: &str) -> Result<Account, GatewayError> {
        let address = address.to_string();
        self.request(|reply| Command::GetAccount(address, reply))
            .await
    }

    async fn simulate(&self, tx: &UnsignedTransaction) -> Result<Simulation, GatewayError> {
        let tx = tx.clone();
        self.request(|reply| Command::Simulate(tx, reply)).await
    }

    async fn prepare(&self, tx: UnsignedTransaction) -> Result<PreparedTransaction, GatewayError> {
        let simulation = self.simulate(&tx).await?;
        Ok(PreparedTransaction::assemble(tx, simulation))
    }

    async fn send(&self, tx: &SignedTransaction) -> Result<SendResponse, GatewayError> {
        let tx = tx.clone();
        self.request(|reply| Command::Send(tx, reply)).await
    }

    async fn get_transaction(&self, hash: &str) -> Result<TransactionResponse, GatewayError> {
        let hash = hash.to_string();
        self.request(|reply| Command::GetTransaction(hash, reply))
            .await
    }
}

fn run(config: SandboxConfig, admin: String, inbox: mpsc::Receiver<Command>) {
    let mut ledger = match catch_unwind(AssertUnwindSafe(|| Host::boot(&config, &admin))) {
        Ok(ledger) => ledger,
        Err(_) => {
            warn!("ledger sandbox failed to boot");
            return;
        }
    };

    while let Ok(command) = inbox.recv() {
        if catch_unwind(AssertUnwindSafe(|| ledger.handle(command))).is_err() {
            warn!("ledger sandbox command panicked");
        }
    }
    debug!("ledger sandbox stopped");
}

enum Tracked {
    Indexing {
        tx: UnsignedTransaction,
        polls_left: u32,
    },
    Final(TransactionResponse),
}

/// State owned by the sandbox thread.
struct Host {
    env: Env,
    contract: Address,
    contract_id: String,
    network_passphrase: String,
    indexing_polls: u32,
    first_sequence: i64,
    accounts: HashMap<String, i64>,
    transactions: HashMap<String, Tracked>,
}

impl Host {
    fn boot(config: &SandboxConfig, admin: &str) -> Self {
        let env = Env::new_with_config(EnvTestConfig {
            capture_snapshot_at_drop: false,
            ..Default::default()
        });
        env.cost_estimate().budget().reset_unlimited();
        env.mock_all_auths();
        env.ledger().set_sequence_number(config.first_ledger);
        env.ledger().set_timestamp(unix_now());

        let at = address(&env, &config.contract_id);
        let contract = env.register_at(&at, ProofOfService, ());

        let client = ProofOfServiceClient::new(&env, &contract);
        let salt = derive_seed(&config.network_passphrase, config.contract_id.as_bytes());
        if client
            .try_init(&address(&env, admin), &BytesN::from_array(&env, &salt))
            .is_err()
        {
            warn!("proof-of-service contract rejected init");
        }

        let mut host = Self {
            env,
            contract,
            contract_id: config.contract_id.clone(),
            network_passphrase: config.network_passphrase.clone(),
            indexing_polls: config.indexing_polls,
            first_sequence: i64::from(config.first_ledger) << 32,
            accounts: HashMap::new(),
            transactions: HashMap::new(),
        };
        host.fund(admin);
        for therapist in &config.therapists {
            host.fund(therapist);
            if let Err(err) = host.set_therapist(therapist, true) {
                warn!(%therapist, error = %err, "could not allow-list therapist");
            }
        }

        info!(
            contract_id = %host.contract_id,
            first_ledger = config.first_ledger,
            therapists = config.therapists.len(),
            "ledger sandbox ready"
        );
        host
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::GetAccount(address, reply) => {
                let _ = reply.send(self.account(&address));
            }
            Command::Simulate(tx, reply) => {
                let _ = reply.send(self.simulate(&tx));
            }
            Command::Send(tx, reply) => {
                let _ = reply.send(Ok(self.send(tx)));
            }
            Command::GetTransaction(hash, reply) => {
                let _ = reply.send(Ok(self.poll(&hash)));
            }
            Command::SetTherapist(address, active, reply) => {
                let result = if is_account_address(&address) {
                    self.set_therapist(&address, active)
                } else {
                    Err(GatewayError::Transport(format!("invalid address {address}")))
                };
                let _ = reply.send(result);
            }
            Command::Fund(address, reply) => {
                let result = if is_account_address(&address) {
                    self.fund(&address);
                    self.account(&address)
                } else {
                    Err(GatewayError::Transport(format!("invalid address {address}")))
                };
                let _ = reply.send(result);
            }
        }
    }

    fn client(&self) -> ProofOfServiceClient<'_> {
        ProofOfServiceClient::new(&self.env, &self.contract)
    }

    fn fund(&mut self, address: &str) {
        self.accounts
            .entry(address.to_string())
            .or_insert(self.first_sequence);
    }

    fn set_therapist(&mut self, address: &str, active: bool) -> Result<(), GatewayError> {
        let therapist = self::address(&self.env, address);
        contract_result(self.client().try_set_therapist(&therapist, &active))
            .map_err(GatewayError::Transport)
    }

    fn account(&self, address: &str) -> Result<Account, GatewayError> {
        self.accounts
            .get(address)
            .map(|sequence| Account {
                address: address.to_string(),
                sequence: *sequence,
            })
            .ok_or_else(|| GatewayError::AccountNotFound(address.to_string()))
    }

    fn simulate(&self, tx: &UnsignedTransaction) -> Result<Simulation, GatewayError> {
        if tx.call.contract_id != self.contract_id {
            return Err(GatewayError::Simulation(format!(
                "contract not found: {}",
                tx.call.contract_id
            )));
        }
        self.account(&tx.source)?;

        let result = self.dry_run(tx).map_err(GatewayError::Simulation)?;
        debug!(function = %tx.call.function, "simulated contract call");

        Ok(Simulation {
            result: Some(result),
            resources: estimate(tx),
            latest_ledger: self.env.ledger().sequence(),
            transaction_data: None,
            auth: Vec::new(),
        })
    }

    /// Evaluate a call against current state without writing to it.
    fn dry_run(&self, tx: &UnsignedTransaction) -> Result<ScVal, String> {
        let env = &self.env;
        let client = self.client();
        let args = &tx.call.args;

        match tx.call.function.as_str() {
            "record_session" => {
                let call = RecordSession::parse(env, args)?;
                contract_result(client.try_get_admin())?;
                if call.therapist_strkey != tx.source {
                    return Err("HostError: Error(Auth, InvalidAction)".to_string());
                }
                if !client.is_therapist(&call.therapist) {
                    return Err(host_error(ContractError::TherapistNotAuthorized));
                }
                proof_of_service::validation::validate_session(
                    env,
                    &call.name,
                    &call.pin,
                    &call.kind,
                    &call.status,
                    call.yyyymm,
                )
                .map_err(host_error)?;
                let next = client.get_session_count().saturating_add(1);
                Ok(ScVal::U32(next))
            }
            "get_monthly_count" => {
                let name = bytes_arg(env, args, 0)?;
                let pin = bytes_arg(env, args, 1)?;
                let yyyymm = u32_arg(args, 2)?;
                let kind = symbol_arg(env, args, 3)?;
                let count =
                    contract_result(client.try_get_monthly_count(&name, &pin, &yyyymm, &kind))?;
                Ok(ScVal::U32(count))
            }
            "get_session_count" => Ok(ScVal::U32(client.get_session_count())),
            "is_therapist" => {
                let therapist = address_arg(env, args, 0)?;
                Ok(ScVal::Bool(client.is_therapist(&therapist)))
            }
            "version" => Ok(ScVal::U32(client.version())),
            other => Err(format!("HostError: function {other} not found in contract")),
        }
    }

    fn send(&mut self, signed: SignedTransaction) -> SendResponse {
        let reject = |hash: String, reason: &str| SendResponse {
            hash,
            status: SendStatus::Error,
            error: Some(reason.to_string()),
        };
        let hash = match transaction_hash(&self.network_passphrase, &signed.prepared) {
            Ok(hash) => hex::encode(hash),
            Err(err) => return reject(String::new(), &format!("txMalformed: {err}")),
        };

        if self.transactions.contains_key(&hash) {
            return SendResponse {
                hash,
                status: SendStatus::Duplicate,
                error: None,
            };
        }

        let tx = &signed.prepared.tx;
        if tx.call.contract_id != self.contract_id {
            return reject(hash, "contract not found");
        }
        if let Err(err) = signer::verify(&self.network_passphrase, &signed) {
            debug!(error = %err, "rejecting transaction signature");
            return reject(hash, "txBadAuth: invalid signature");
        }
        let Some(current) = self.accounts.get(&tx.source).copied() else {
            return reject(hash, "txNoAccount");
        };
        if tx.sequence != current + 1 {
            return reject(hash, "txBadSeq");
        }
        if tx.max_time < unix_now() {
            return reject(hash, "txTooLate");
        }

        self.accounts.insert(tx.source.clone(), tx.sequence);
        self.transactions.insert(
            hash.clone(),
            Tracked::Indexing {
                tx: tx.clone(),
                polls_left: self.indexing_polls,
            },
        );
        debug!(%hash, "transaction accepted");

        SendResponse {
            hash,
            status: SendStatus::Pending,
            error: None,
        }
    }

    fn poll(&mut self, hash: &str) -> TransactionResponse {
        let tx = match self.transactions.get_mut(hash) {
            None => return TransactionResponse::not_found(),
            Some(Tracked::Final(response)) => return response.clone(),
            Some(Tracked::Indexing { polls_left, .. }) if *polls_left > 0 => {
                *polls_left -= 1;
                return TransactionResponse::not_found();
            }
            Some(Tracked::Indexing { tx, .. }) => tx.clone(),
        };

        let response = self.apply(&tx);
        info!(%hash, status = %response.status, "transaction applied");
        self.transactions
            .insert(hash.to_string(), Tracked::Final(response.clone()));
        response
    }

    fn apply(&mut self, tx: &UnsignedTransaction) -> TransactionResponse {
        let sequence = self.env.ledger().sequence() + 1;
        self.env.ledger().set_sequence_number(sequence);
        self.env.ledger().set_timestamp(unix_now());

        let outcome = match tx.call.function.as_str() {
            "record_session" => RecordSession::parse(&self.env, &tx.call.args).and_then(|call| {
                let client = self.client();
                contract_result(client.try_record_session(
                    &call.therapist,
                    &call.name,
                    &call.pin,
                    &call.kind,
                    &call.status,
                    &call.yyyymm,
                ))
                .map(ScVal::U32)
            }),
            _ => self.dry_run(tx),
        };

        match outcome {
            Ok(value) => TransactionResponse {
                status: TxStatus::Success,
                ledger: Some(sequence),
                return_value: Some(value.clone()),
                result_meta: Some(TransactionMeta {
                    return_value: Some(value.clone()),
                    events: 1,
                }),
                result: serde_json::to_value(&value).ok(),
                error: None,
            },
            Err(reason) => TransactionResponse {
                status: TxStatus::Failed,
                ledger: Some(sequence),
                return_value: None,
                result_meta: None,
                result: None,
                error: Some(reason),
            },
        }
    }
}

/// Decoded `record_session` arguments, in contract order.
struct RecordSession {
    therapist: Address,
    therapist_strkey: String,
    name: Bytes,
    pin: Bytes,
    kind: Symbol,
    status: Symbol,
    yyyymm: u32,
}

impl RecordSession {
    fn parse(env: &Env, args: &[ScVal]) -> Result<Self, String> {
        if args.len() != 6 {
            return Err(format!(
                "HostError: record_session expects 6 arguments, got {}",
                args.len()
            ));
        }
        let therapist_strkey = match &args[0] {
            ScVal::Address(strkey) => strkey.clone(),
            other => return Err(format!("argument 0: expected address, got {other:?}")),
        };
        Ok(Self {
            therapist: address_arg(env, args, 0)?,
            therapist_strkey,
            name: bytes_arg(env, args, 1)?,
            pin: bytes_arg(env, args, 2)?,
            kind: symbol_arg(env, args, 3)?,
            status: symbol_arg(env, args, 4)?,
            yyyymm: u32_arg(args, 5)?,
        })
    }
}

fn bytes_arg(env: &Env, args: &[ScVal], index: usize) -> Result<Bytes, String> {
    match args.get(index) {
        Some(ScVal::Bytes(bytes)) => Ok(Bytes::from_slice(env, bytes)),
        other => Err(format!("argument {index}: expected bytes, got {other:?}")),
    }
}

fn u32_arg(args: &[ScVal], index: usize) -> Result<u32, String> {
    args.get(index)
        .and_then(ScVal::as_u32)
        .ok_or_else(|| format!("argument {index}: expected u32"))
}

fn symbol_arg(env: &Env, args: &[ScVal], index: usize) -> Result<Symbol, String> {
    match args.get(index) {
        Some(ScVal::Symbol(symbol))
            if !symbol.is_empty()
                && symbol.len() <= 32
                && symbol.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') =>
        {
            Ok(Symbol::new(env, symbol))
        }
        other => Err(format!("argument {index}: expected symbol, got {other:?}")),
    }
}

fn address_arg(env: &Env, args: &[ScVal], index: usize) -> Result<Address, String> {
    match args.get(index) {
        Some(ScVal::Address(strkey)) if is_address(strkey) => Ok(address(env, strkey)),
        other => Err(format!("argument {index}: expected address, got {other:?}")),
    }
}

/// Caller must have checked `strkey` with [`is_address`].
fn address(env: &Env, strkey: &str) -> Address {
    Address::from_string(&SorobanString::from_str(env, strkey))
}

fn is_address(strkey: &str) -> bool {
    matches!(
        Strkey::from_string(strkey),
        Ok(Strkey::PublicKeyEd25519(_)) | Ok(Strkey::Contract(_))
    )
}

fn is_account_address(strkey: &str) -> bool {
    matches!(Strkey::from_string(strkey), Ok(Strkey::PublicKeyEd25519(_)))
}

fn host_error(err: ContractError) -> String {
    format!("HostError: {:?}", soroban_sdk::Error::from(err))
}

/// Flatten a `try_` client result, rendering contract errors as
/// `Error(Contract, #N)`.
fn contract_result<T, C, E>(result: Result<Result<T, C>, Result<E, InvokeError>>) -> Result<T, String>
where
    C: fmt::Debug,
    E: Into<soroban_sdk::Error>,
{
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(conversion)) => Err(format!("HostError: result conversion failed: {conversion:?}")),
        Err(Ok(err)) => {
            let err: soroban_sdk::Error = err.into();
            Err(format!("HostError: {err:?}"))
        }
        Err(Err(invoke)) => Err(format!("HostError: {invoke:?}")),
    }
}

fn estimate(tx: &UnsignedTransaction) -> ResourceEstimate {
    let payload = serde_json::to_vec(&tx.call.args).map(|v| v.len()).unwrap_or(0);
    let payload = u32::try_from(payload).unwrap_or(u32::MAX);
    let writes = if tx.call.function == "record_session" {
        payload.saturating_add(256)
    } else {
        0
    };
    ResourceEstimate {
        instructions: BASE_INSTRUCTIONS + u64::from(payload) * 1_000,
        read_bytes: payload.saturating_add(512),
        write_bytes: writes,
        min_resource_fee: RESOURCE_FEE_FLOOR + i64::from(writes) * FEE_PER_BYTE,
    }
}

fn derive_seed(passphrase: &str, label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.update(label);
    hasher.finalize().into()
}
