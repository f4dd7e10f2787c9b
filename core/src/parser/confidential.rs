//! Confidential-transfer parser
//!
//! Amounts of confidential transfers are encrypted on-chain. Token account
//! owners stay visible in post balances, so sender and recipient are
//! recovered while the amount is kept only as opaque ciphertext.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::consts::TOKEN_2022_PROGRAM_ID;
use crate::raw::{RawInstruction, RawTransaction};
use crate::types::{Transfer, TransferKind};

use super::{tx_context, DomainEvent, Unclassified};

static CONFIDENTIAL_IX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ConfidentialTransferInstruction::(\w+)").expect("Invalid confidential ix regex")
});

/// Info fields that carry encrypted amounts, in preference order.
const CIPHERTEXT_FIELDS: [&str; 4] = [
    "ciphertext",
    "encryptedAmount",
    "newSourceDecryptableAvailableBalance",
    "newDecryptableAvailableBalance",
];

const TOKEN_2022_PROGRAM_NAME: &str = "spl-token-2022";

fn kind_from_log(name: &str) -> Option<TransferKind> {
    match name {
        "Transfer" | "TransferWithFee" | "TransferWithSplitProofs" => Some(TransferKind::Confidential),
        "Deposit" => Some(TransferKind::ConfidentialDeposit),
        "Withdraw" => Some(TransferKind::ConfidentialWithdraw),
        _ => None,
    }
}

fn kind_from_parsed_type(ix_type: &str) -> Option<TransferKind> {
    let lower = ix_type.to_ascii_lowercase();
    if !lower.contains("confidential") {
        return None;
    }
    if lower.contains("deposit") {
        Some(TransferKind::ConfidentialDeposit)
    } else if lower.contains("withdraw") {
        Some(TransferKind::ConfidentialWithdraw)
    } else if lower.contains("transfer") {
        Some(TransferKind::Confidential)
    } else {
        None
    }
}

fn is_token_2022(ix: &RawInstruction) -> bool {
    ix.program_id.as_deref() == Some(TOKEN_2022_PROGRAM_ID)
        || ix.program.as_deref() == Some(TOKEN_2022_PROGRAM_NAME)
}

/// `parsed.info.amount`, given either as a string or a number.
fn info_amount(ix: &RawInstruction) -> Option<u64> {
    match ix.parsed.as_ref()?.get("info")?.get("amount")? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ConfidentialParser {
    mint: Option<String>,
}

impl ConfidentialParser {
    pub fn new(mint: Option<String>) -> Self {
        Self { mint }
    }

    /// Kind of confidential activity, and the parsed instruction that carries
    /// it when one exists.
    fn detect<'a>(&self, tx: &'a RawTransaction) -> Option<(TransferKind, Option<&'a RawInstruction>)> {
        let parsed = tx
            .all_instructions()
            .find_map(|ix| kind_from_parsed_type(ix.parsed_type()?).map(|kind| (kind, ix)));
        if let Some((kind, ix)) = parsed {
            return Some((kind, Some(ix)));
        }
        tx.log_messages()
            .iter()
            .filter_map(|log| CONFIDENTIAL_IX_REGEX.captures(log))
            .find_map(|cap| kind_from_log(&cap[1]))
            .map(|kind| (kind, None))
    }

    fn ciphertext(tx: &RawTransaction, ix: Option<&RawInstruction>) -> Option<String> {
        let from_info = ix.into_iter().chain(tx.all_instructions()).find_map(|ix| {
            CIPHERTEXT_FIELDS
                .iter()
                .find_map(|field| ix.info_str(field))
                .map(str::to_string)
        });
        from_info.or_else(|| {
            tx.all_instructions()
                .filter(|ix| is_token_2022(ix))
                .find_map(|ix| ix.data.clone())
        })
    }

    pub fn parse(&self, protocol: &str, tx: &RawTransaction) -> Result<DomainEvent, Unclassified> {
        let ctx = tx_context(tx)?;
        let (kind, ix) = self.detect(tx).ok_or(Unclassified::NotConfidentialTransfer)?;

        let balances: Vec<_> = tx
            .post_token_balances()
            .iter()
            .filter(|b| self.mint.as_deref().map_or(true, |m| b.mint == m))
            .collect();
        let mut owners: Vec<&str> = Vec::new();
        for owner in balances.iter().filter_map(|b| b.owner.as_deref()) {
            if !owners.contains(&owner) {
                owners.push(owner);
            }
        }
        let first = balances.first().ok_or(Unclassified::MissingOwners)?;
        let first_owner = *owners.first().ok_or(Unclassified::MissingOwners)?;

        let sender = match tx.fee_payer() {
            Some(payer) if owners.contains(&payer) => payer,
            _ => first_owner,
        };
        let recipient = owners
            .iter()
            .copied()
            .find(|o| *o != sender)
            .unwrap_or(sender);

        let amount = match kind {
            TransferKind::Confidential => None,
            _ => {
                let delta: i128 = tx
                    .token_deltas()
                    .iter()
                    .filter(|d| d.owner.as_deref() == Some(sender) && d.mint == first.mint)
                    .map(|d| d.delta)
                    .sum();
                if delta != 0 {
                    Some(delta.unsigned_abs().min(u64::MAX as u128) as u64)
                } else {
                    ix.and_then(info_amount)
                }
            }
        };

        Ok(DomainEvent::Transfer(Transfer {
            protocol: protocol.to_string(),
            signature: ctx.signature.to_string(),
            timestamp: ctx.timestamp,
            slot: ctx.slot,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            token: first.mint.clone(),
            decimals: first.decimals(),
            kind,
            ciphertext: Self::ciphertext(tx, ix),
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_tx::*;
    use super::*;

    const MINT: &str = "6kJMMw6psY1MjH3T3yK351uw1FL1aE7rF3xKFz4prHb";

    fn confidential_tx(logs: Vec<&str>, instructions: Value, pre_amount: &str, post_amount: &str) -> RawTransaction {
        serde_json::from_value(json!({
            "slot": 42,
            "blockTime": 1_700_000_000i64,
            "transaction": {
                "signatures": ["ctSig"],
                "message": {
                    "accountKeys": [PAYER, POOL, RECIPIENT],
                    "instructions": instructions
                }
            },
            "meta": {
                "err": null,
                "fee": 5000,
                "preBalances": [1_000_000_000u64, 2_039_280u64, 2_039_280u64],
                "postBalances": [999_995_000u64, 2_039_280u64, 2_039_280u64],
                "logMessages": logs,
                "preTokenBalances": [
                    {"accountIndex": 1, "mint": MINT, "owner": PAYER,
                     "uiTokenAmount": {"amount": pre_amount, "decimals": 6}},
                    {"accountIndex": 2, "mint": MINT, "owner": OTHER,
                     "uiTokenAmount": {"amount": "0", "decimals": 6}}
                ],
                "postTokenBalances": [
                    {"accountIndex": 1, "mint": MINT, "owner": PAYER,
                     "uiTokenAmount": {"amount": post_amount, "decimals": 6}},
                    {"accountIndex": 2, "mint": MINT, "owner": OTHER,
                     "uiTokenAmount": {"amount": "0", "decimals": 6}}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_confidential_transfer_hides_amount() {
        let tx = confidential_tx(
            vec![
                "Program TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb invoke [1]",
                "Program log: ConfidentialTransferInstruction::Transfer",
            ],
            json!([{ "programId": TOKEN_2022_PROGRAM_ID, "data": "3Bxs4h24hBtQy9rw", "accounts": [] }]),
            "0",
            "0",
        );
        let DomainEvent::Transfer(t) = ConfidentialParser::new(None).parse("ct", &tx).unwrap() else {
            panic!("expected transfer");
        };
        assert_eq!(t.kind, TransferKind::Confidential);
        assert_eq!(t.amount, None);
        assert_eq!(t.sender, PAYER);
        assert_eq!(t.recipient, OTHER);
        assert_eq!(t.token, MINT);
        assert_eq!(t.decimals, 6);
        assert_eq!(t.ciphertext.as_deref(), Some("3Bxs4h24hBtQy9rw"));
    }

    #[test]
    fn test_parsed_instruction_ciphertext_and_deposit_amount() {
        let tx = confidential_tx(
            vec![],
            json!([{
                "programId": TOKEN_2022_PROGRAM_ID,
                "program": "spl-token-2022",
                "parsed": {
                    "type": "confidentialTransferDeposit",
                    "info": { "amount": "1500000", "encryptedAmount": "ZW5jcnlwdGVk" }
                }
            }]),
            "2000000",
            "500000",
        );
        let DomainEvent::Transfer(t) = ConfidentialParser::new(Some(MINT.to_string()))
            .parse("ct", &tx)
            .unwrap()
        else {
            panic!("expected transfer");
        };
        assert_eq!(t.kind, TransferKind::ConfidentialDeposit);
        assert_eq!(t.amount, Some(1_500_000));
        assert_eq!(t.ciphertext.as_deref(), Some("ZW5jcnlwdGVk"));
    }

    #[test]
    fn test_withdraw_amount_falls_back_to_info() {
        let tx = confidential_tx(
            vec!["Program log: ConfidentialTransferInstruction::Withdraw"],
            json!([{
                "programId": TOKEN_2022_PROGRAM_ID,
                "parsed": { "type": "confidentialTransferWithdraw", "info": { "amount": 750000 } }
            }]),
            "0",
            "0",
        );
        let DomainEvent::Transfer(t) = ConfidentialParser::new(None).parse("ct", &tx).unwrap() else {
            panic!("expected transfer");
        };
        assert_eq!(t.kind, TransferKind::ConfidentialWithdraw);
        assert_eq!(t.amount, Some(750_000));
    }

    #[test]
    fn test_plain_transaction_is_not_confidential() {
        let tx = confidential_tx(vec!["Program log: Instruction: Transfer"], json!([]), "10", "5");
        assert_eq!(
            ConfidentialParser::new(None).parse("ct", &tx),
            Err(Unclassified::NotConfidentialTransfer)
        );
    }

    #[test]
    fn test_other_mint_has_no_owners() {
        let tx = confidential_tx(
            vec!["Program log: ConfidentialTransferInstruction::TransferWithFee"],
            json!([]),
            "0",
            "0",
        );
        assert_eq!(
            ConfidentialParser::new(Some(POOL.to_string())).parse("ct", &tx),
            Err(Unclassified::MissingOwners)
        );
    }
}
