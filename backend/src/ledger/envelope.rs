//! Stellar XDR form of the gateway model.
//!
//! A session write travels as a `TransactionEnvelope` holding a single
//! `InvokeHostFunction` operation. The transaction hash is the sha256 of the
//! `TransactionSignaturePayload`, exactly as the network computes it, so the
//! hash a signer commits to is the one explorers index.

use sha2::{Digest, Sha256};
use stellar_strkey::Strkey;
use stellar_xdr::curr::{
    AccountId, BytesM, ContractId, DecoratedSignature, Hash, HostFunction, Int128Parts,
    InvokeContractArgs, InvokeHostFunctionOp, LedgerEntryData, LedgerKey, LedgerKeyAccount,
    Limits, Memo, MuxedAccount, Operation, OperationBody, OperationResult, OperationResultTr,
    Preconditions, PublicKey, ReadXdr, ScAddress, ScBytes, ScSymbol, ScVal as XdrScVal, ScVec,
    SequenceNumber, Signature, SignatureHint, SorobanAuthorizationEntry, SorobanTransactionData,
    StringM, TimeBounds, TimePoint, Transaction, TransactionEnvelope, TransactionExt,
    TransactionMeta as XdrTransactionMeta, TransactionResult, TransactionResultResult,
    TransactionSignaturePayload, TransactionSignaturePayloadTaggedTransaction,
    TransactionV1Envelope, Uint256, VecM, WriteXdr,
};
use thiserror::Error;

use super::{
    PreparedTransaction, ResourceEstimate, ScVal, SignedTransaction, TransactionMeta,
    UnsignedTransaction,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("{0} is not a valid G... account address")]
    InvalidAccount(String),

    #[error("{0} is not a valid account or contract address")]
    InvalidAddress(String),

    #[error("fee {0} does not fit a transaction")]
    InvalidFee(i64),

    #[error("signature is not valid hex ed25519")]
    InvalidSignature,

    #[error("unsupported ledger value {0}")]
    Unsupported(&'static str),

    #[error("xdr: {0}")]
    Xdr(String),
}

impl From<stellar_xdr::curr::Error> for EnvelopeError {
    fn from(err: stellar_xdr::curr::Error) -> Self {
        EnvelopeError::Xdr(err.to_string())
    }
}

/// Raw ed25519 key of a `G...` address.
pub fn account_key(strkey: &str) -> Result<[u8; 32], EnvelopeError> {
    match Strkey::from_string(strkey) {
        Ok(Strkey::PublicKeyEd25519(key)) => Ok(key.0),
        _ => Err(EnvelopeError::InvalidAccount(strkey.to_string())),
    }
}

fn account_id(strkey: &str) -> Result<AccountId, EnvelopeError> {
    Ok(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(
        account_key(strkey)?,
    ))))
}

pub fn sc_address(strkey: &str) -> Result<ScAddress, EnvelopeError> {
    match Strkey::from_string(strkey) {
        Ok(Strkey::PublicKeyEd25519(key)) => Ok(ScAddress::Account(AccountId(
            PublicKey::PublicKeyTypeEd25519(Uint256(key.0)),
        ))),
        Ok(Strkey::Contract(contract)) => Ok(ScAddress::Contract(ContractId(Hash(contract.0)))),
        _ => Err(EnvelopeError::InvalidAddress(strkey.to_string())),
    }
}

fn address_strkey(address: &ScAddress) -> Result<String, EnvelopeError> {
    match address {
        ScAddress::Account(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(key)))) => {
            Ok(stellar_strkey::ed25519::PublicKey(*key).to_string())
        }
        ScAddress::Contract(ContractId(Hash(id))) => Ok(stellar_strkey::Contract(*id).to_string()),
        other => Err(EnvelopeError::Unsupported(other.name())),
    }
}

fn symbol(text: &str) -> Result<ScSymbol, EnvelopeError> {
    Ok(ScSymbol(StringM::try_from(text.as_bytes().to_vec())?))
}

pub fn to_xdr_val(value: &ScVal) -> Result<XdrScVal, EnvelopeError> {
    Ok(match value {
        ScVal::Void => XdrScVal::Void,
        ScVal::Bool(b) => XdrScVal::Bool(*b),
        ScVal::U32(v) => XdrScVal::U32(*v),
        ScVal::U64(v) => XdrScVal::U64(*v),
        ScVal::I128(v) => XdrScVal::I128(Int128Parts {
            hi: (*v >> 64) as i64,
            lo: *v as u64,
        }),
        ScVal::Symbol(s) => XdrScVal::Symbol(symbol(s)?),
        ScVal::Bytes(bytes) => XdrScVal::Bytes(ScBytes(BytesM::try_from(bytes.clone())?)),
        ScVal::Address(strkey) => XdrScVal::Address(sc_address(strkey)?),
        ScVal::Vec(items) => {
            let items = items.iter().map(to_xdr_val).collect::<Result<Vec<_>, _>>()?;
            XdrScVal::Vec(Some(ScVec(items.try_into()?)))
        }
    })
}

pub fn from_xdr_val(value: &XdrScVal) -> Result<ScVal, EnvelopeError> {
    Ok(match value {
        XdrScVal::Void => ScVal::Void,
        XdrScVal::Bool(b) => ScVal::Bool(*b),
        XdrScVal::U32(v) => ScVal::U32(*v),
        XdrScVal::U64(v) => ScVal::U64(*v),
        XdrScVal::I128(parts) => ScVal::I128((i128::from(parts.hi) << 64) | i128::from(parts.lo)),
        XdrScVal::Symbol(s) => ScVal::Symbol(String::from_utf8_lossy(s.0.as_slice()).into_owned()),
        XdrScVal::Bytes(bytes) => ScVal::Bytes(bytes.0.as_slice().to_vec()),
        XdrScVal::Address(address) => ScVal::Address(address_strkey(address)?),
        XdrScVal::Vec(Some(items)) => ScVal::Vec(
            items
                .0
                .iter()
                .map(from_xdr_val)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        XdrScVal::Vec(None) => ScVal::Vec(Vec::new()),
        other => return Err(EnvelopeError::Unsupported(other.name())),
    })
}

pub fn decode_sc_val(b64: &str) -> Result<ScVal, EnvelopeError> {
    from_xdr_val(&XdrScVal::from_xdr_base64(b64, Limits::none())?)
}

fn build(
    tx: &UnsignedTransaction,
    fee: u32,
    soroban_data: Option<SorobanTransactionData>,
    auth: Vec<SorobanAuthorizationEntry>,
) -> Result<Transaction, EnvelopeError> {
    let args = tx
        .call
        .args
        .iter()
        .map(to_xdr_val)
        .collect::<Result<Vec<_>, _>>()?;
    let invoke = InvokeHostFunctionOp {
        host_function: HostFunction::InvokeContract(InvokeContractArgs {
            contract_address: sc_address(&tx.call.contract_id)?,
            function_name: symbol(&tx.call.function)?,
            args: args.try_into()?,
        }),
        auth: auth.try_into()?,
    };
    let operation = Operation {
        source_account: None,
        body: OperationBody::InvokeHostFunction(invoke),
    };

    Ok(Transaction {
        source_account: MuxedAccount::Ed25519(Uint256(account_key(&tx.source)?)),
        fee,
        seq_num: SequenceNumber(tx.sequence),
        cond: Preconditions::Time(TimeBounds {
            min_time: TimePoint(0),
            max_time: TimePoint(tx.max_time),
        }),
        memo: Memo::None,
        operations: vec![operation].try_into()?,
        ext: match soroban_data {
            Some(data) => TransactionExt::V1(data),
            None => TransactionExt::V0,
        },
    })
}

/// The network transaction for a prepared call: fee, footprint and auth
/// entries as returned by simulation.
pub fn network_transaction(prepared: &PreparedTransaction) -> Result<Transaction, EnvelopeError> {
    let fee =
        u32::try_from(prepared.total_fee).map_err(|_| EnvelopeError::InvalidFee(prepared.total_fee))?;
    let soroban_data = prepared
        .soroban_data
        .as_deref()
        .map(|data| SorobanTransactionData::from_xdr_base64(data, Limits::none()))
        .transpose()?;
    let auth = prepared
        .auth
        .iter()
        .map(|entry| SorobanAuthorizationEntry::from_xdr_base64(entry, Limits::none()))
        .collect::<Result<Vec<_>, _>>()?;
    build(&prepared.tx, fee, soroban_data, auth)
}

/// sha256 of the `TransactionSignaturePayload` for `network_passphrase`.
pub fn transaction_hash(
    network_passphrase: &str,
    prepared: &PreparedTransaction,
) -> Result<[u8; 32], EnvelopeError> {
    let payload = TransactionSignaturePayload {
        network_id: Hash(Sha256::digest(network_passphrase.as_bytes()).into()),
        tagged_transaction: TransactionSignaturePayloadTaggedTransaction::Tx(network_transaction(
            prepared,
        )?),
    };
    Ok(Sha256::digest(payload.to_xdr(Limits::none())?).into())
}

/// Unsigned envelope for `simulateTransaction`.
pub fn simulation_envelope(tx: &UnsignedTransaction) -> Result<String, EnvelopeError> {
    let envelope = TransactionEnvelope::Tx(TransactionV1Envelope {
        tx: build(tx, tx.base_fee, None, Vec::new())?,
        signatures: VecM::default(),
    });
    Ok(envelope.to_xdr_base64(Limits::none())?)
}

/// Base64 envelope for `sendTransaction`.
pub fn signed_envelope(signed: &SignedTransaction) -> Result<String, EnvelopeError> {
    let key = account_key(&signed.public_key)?;
    let signature = hex::decode(&signed.signature).map_err(|_| EnvelopeError::InvalidSignature)?;
    let decorated = DecoratedSignature {
        hint: SignatureHint([key[28], key[29], key[30], key[31]]),
        signature: Signature(signature.try_into()?),
    };
    let envelope = TransactionEnvelope::Tx(TransactionV1Envelope {
        tx: network_transaction(&signed.prepared)?,
        signatures: vec![decorated].try_into()?,
    });
    Ok(envelope.to_xdr_base64(Limits::none())?)
}

pub fn account_ledger_key(address: &str) -> Result<String, EnvelopeError> {
    let key = LedgerKey::Account(LedgerKeyAccount {
        account_id: account_id(address)?,
    });
    Ok(key.to_xdr_base64(Limits::none())?)
}

/// Sequence number from a base64 `LedgerEntryData::Account`.
pub fn account_sequence(entry_data: &str) -> Result<i64, EnvelopeError> {
    match LedgerEntryData::from_xdr_base64(entry_data, Limits::none())? {
        LedgerEntryData::Account(account) => Ok(account.seq_num.0),
        other => Err(EnvelopeError::Unsupported(other.name())),
    }
}

/// Declared resources of a base64 `SorobanTransactionData`.
pub fn declared_resources(data: &str, min_resource_fee: i64) -> Result<ResourceEstimate, EnvelopeError> {
    let data = SorobanTransactionData::from_xdr_base64(data, Limits::none())?;
    Ok(ResourceEstimate {
        instructions: u64::from(data.resources.instructions),
        read_bytes: data.resources.disk_read_bytes,
        write_bytes: data.resources.write_bytes,
        min_resource_fee,
    })
}

/// Result code of a base64 `TransactionResult`, spelled the way the
/// network documents it (`txBadSeq`, `txFailed: InvokeHostFunctionTrapped`).
pub fn result_code(result_xdr: &str) -> Result<String, EnvelopeError> {
    let result = TransactionResult::from_xdr_base64(result_xdr, Limits::none())?;
    Ok(match &result.result {
        TransactionResultResult::TxFailed(operations) => {
            let detail: Vec<&str> = operations
                .iter()
                .map(|op| match op {
                    OperationResult::OpInner(OperationResultTr::InvokeHostFunction(inner)) => {
                        inner.name()
                    }
                    other => other.name(),
                })
                .collect();
            format!("txFailed: {}", detail.join(", "))
        }
        other => lower_first(other.name()),
    })
}

/// Return value and event count from a base64 `TransactionMeta`.
pub fn meta_return_value(meta_xdr: &str) -> Result<TransactionMeta, EnvelopeError> {
    match XdrTransactionMeta::from_xdr_base64(meta_xdr, Limits::none())? {
        XdrTransactionMeta::V3(meta) => {
            let Some(soroban) = meta.soroban_meta else {
                return Ok(TransactionMeta::default());
            };
            Ok(TransactionMeta {
                return_value: Some(from_xdr_val(&soroban.return_value)?),
                events: u32::try_from(soroban.events.len()).unwrap_or(u32::MAX),
            })
        }
        XdrTransactionMeta::V4(meta) => Ok(TransactionMeta {
            return_value: meta
                .soroban_meta
                .and_then(|soroban| soroban.return_value)
                .map(|value| from_xdr_val(&value))
                .transpose()?,
            events: u32::try_from(meta.events.len()).unwrap_or(u32::MAX),
        }),
        other => Err(EnvelopeError::Unsupported(other.name())),
    }
}

fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
