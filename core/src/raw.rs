//! Raw parsed transaction model
//!
//! Typed view of a `getTransaction` response (jsonParsed encoding), plus the
//! balance-delta extraction every parser builds on.
//!
//! Every accessor is total: missing meta, null arrays and mismatched pre/post
//! lengths degrade to empty results instead of failing.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::consts::{MS_PER_SECOND, UNKNOWN};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    #[serde(default, deserialize_with = "null_as_default")]
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub meta: Option<RawMeta>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub transaction: RawEnvelope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fee: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pre_balances: Vec<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub post_balances: Vec<u64>,
    #[serde(default)]
    pub pre_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    pub post_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    pub log_messages: Option<Vec<String>>,
    #[serde(default)]
    pub inner_instructions: Option<Vec<InnerInstructions>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    #[serde(default, deserialize_with = "null_as_default")]
    pub signatures: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: RawMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub account_keys: Vec<AccountKey>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub instructions: Vec<RawInstruction>,
}

/// Account keys come either as plain strings or as
/// `{ "pubkey": "...", "signer": bool, "writable": bool }` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountKey {
    Plain(String),
    Parsed {
        pubkey: String,
        #[serde(default)]
        signer: bool,
        #[serde(default)]
        writable: bool,
    },
}

impl AccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            AccountKey::Plain(key) => key,
            AccountKey::Parsed { pubkey, .. } => pubkey,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInstruction {
    #[serde(default)]
    pub program_id: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub parsed: Option<Value>,
    #[serde(default)]
    pub data: Option<String>,
}

impl RawInstruction {
    /// `parsed.type` for jsonParsed instructions.
    pub fn parsed_type(&self) -> Option<&str> {
        self.parsed.as_ref()?.get("type")?.as_str()
    }

    /// `parsed.info.<field>` as a string.
    pub fn info_str(&self, field: &str) -> Option<&str> {
        self.parsed.as_ref()?.get("info")?.get(field)?.as_str()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InnerInstructions {
    #[serde(default, deserialize_with = "null_as_default")]
    pub index: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub instructions: Vec<RawInstruction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub account_index: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// `None` when the provider left the amount out.
    #[serde(default)]
    pub ui_token_amount: Option<UiTokenAmount>,
}

impl TokenBalance {
    pub fn decimals(&self) -> u8 {
        self.ui_token_amount.as_ref().map_or(0, |a| a.decimals)
    }

    fn raw(&self) -> Option<u64> {
        self.ui_token_amount.as_ref().map(UiTokenAmount::raw)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiTokenAmount {
    #[serde(default, deserialize_with = "null_as_default")]
    pub amount: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub decimals: u8,
    #[serde(default)]
    pub ui_amount: Option<f64>,
}

impl UiTokenAmount {
    fn raw(&self) -> u64 {
        self.amount.parse::<u64>().unwrap_or(0)
    }
}

/// Missing and `null` both mean the default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Signed native balance change of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDelta {
    pub index: usize,
    pub address: String,
    pub delta: i128,
}

impl AccountDelta {
    pub fn gain(&self) -> u64 {
        if self.delta > 0 {
            self.delta.min(u64::MAX as i128) as u64
        } else {
            0
        }
    }

    pub fn loss(&self) -> u64 {
        if self.delta < 0 {
            (-self.delta).min(u64::MAX as i128) as u64
        } else {
            0
        }
    }
}

/// Signed token balance change of one token account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDelta {
    pub account_index: usize,
    pub owner: Option<String>,
    pub mint: String,
    pub delta: i128,
    pub decimals: u8,
}

impl RawTransaction {
    pub fn signature(&self) -> Option<&str> {
        self.transaction.signatures.first().map(String::as_str)
    }

    /// Block time in milliseconds. Chain block time has second resolution.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.block_time.map(|t| t.saturating_mul(MS_PER_SECOND))
    }

    pub fn account_key(&self, index: usize) -> Option<&str> {
        self.transaction
            .message
            .account_keys
            .get(index)
            .map(AccountKey::pubkey)
    }

    /// The fee payer is always account 0.
    pub fn fee_payer(&self) -> Option<&str> {
        self.account_key(0)
    }

    pub fn fee(&self) -> u64 {
        self.meta.as_ref().map(|m| m.fee).unwrap_or(0)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self.meta.as_ref().and_then(|m| m.err.as_ref()),
            Some(err) if !err.is_null()
        )
    }

    pub fn log_messages(&self) -> &[String] {
        self.meta
            .as_ref()
            .and_then(|m| m.log_messages.as_deref())
            .unwrap_or(&[])
    }

    /// Top-level instructions followed by every inner instruction.
    pub fn all_instructions(&self) -> impl Iterator<Item = &RawInstruction> {
        let inner = self
            .meta
            .as_ref()
            .and_then(|m| m.inner_instructions.as_deref())
            .unwrap_or(&[]);
        self.transaction
            .message
            .instructions
            .iter()
            .chain(inner.iter().flat_map(|group| group.instructions.iter()))
    }

    /// Non-zero native balance changes. Accounts past the shorter of the
    /// pre/post arrays are ignored; accounts without a key get "unknown".
    pub fn native_deltas(&self) -> Vec<AccountDelta> {
        let Some(meta) = self.meta.as_ref() else {
            return Vec::new();
        };

        meta.pre_balances
            .iter()
            .zip(meta.post_balances.iter())
            .enumerate()
            .filter_map(|(index, (pre, post))| {
                let delta = (*post as i128) - (*pre as i128);
                if delta == 0 {
                    return None;
                }
                Some(AccountDelta {
                    index,
                    address: self.account_key(index).unwrap_or(UNKNOWN).to_string(),
                    delta,
                })
            })
            .collect()
    }

    /// Non-zero token balance changes, including token accounts that only
    /// exist before (closed) or after (created) the transaction. Accounts
    /// with an unknown amount on either side are skipped.
    pub fn token_deltas(&self) -> Vec<TokenDelta> {
        let Some(meta) = self.meta.as_ref() else {
            return Vec::new();
        };
        let pre = meta.pre_token_balances.as_deref().unwrap_or(&[]);
        let post = meta.post_token_balances.as_deref().unwrap_or(&[]);

        let mut deltas = Vec::new();

        for before in pre {
            let Some(pre_raw) = before.raw() else {
                continue;
            };
            let after = post.iter().find(|p| p.account_index == before.account_index);
            let post_raw = match after {
                Some(p) => match p.raw() {
                    Some(raw) => raw,
                    None => continue,
                },
                None => 0,
            };
            let delta = (post_raw as i128) - (pre_raw as i128);
            if delta == 0 {
                continue;
            }
            deltas.push(TokenDelta {
                account_index: before.account_index,
                owner: before
                    .owner
                    .clone()
                    .or_else(|| after.and_then(|p| p.owner.clone())),
                mint: before.mint.clone(),
                delta,
                decimals: before.decimals(),
            });
        }

        for after in post {
            if pre.iter().any(|p| p.account_index == after.account_index) {
                continue;
            }
            let post_raw = after.raw().unwrap_or(0);
            if post_raw == 0 {
                continue;
            }
            deltas.push(TokenDelta {
                account_index: after.account_index,
                owner: after.owner.clone(),
                mint: after.mint.clone(),
                delta: post_raw as i128,
                decimals: after.decimals(),
            });
        }

        deltas
    }

    /// Post-transaction token balances (owners stay visible even when the
    /// amount is encrypted).
    pub fn post_token_balances(&self) -> &[TokenBalance] {
        self.meta
            .as_ref()
            .and_then(|m| m.post_token_balances.as_deref())
            .unwrap_or(&[])
    }
}

/// Loose base58 address check: 32-byte keys encode to 32-44 characters.
pub fn is_valid_address(address: &str) -> bool {
    if address.len() < 32 || address.len() > 44 {
        return false;
    }
    matches!(bs58::decode(address).into_vec(), Ok(bytes) if bytes.len() == 32)
}
