//! Balance-flow parser
//!
//! Infers direction from native balance deltas alone. The fee payer
//! (account 0) losing a significant amount that nobody else out-gains is a
//! deposit; a non-payer account gaining a significant amount is a withdrawal.

use crate::consts::UNKNOWN;
use crate::raw::{AccountDelta, RawTransaction};
use crate::types::{Deposit, Withdrawal};

use super::{extract_proof_tag, tx_context, DomainEvent, Unclassified};

/// Outcome of the balance-flow decision procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowDecision {
    Deposit {
        depositor: String,
        /// Payer loss with the network fee added back
        amount: u64,
    },
    Withdrawal {
        recipient: String,
        amount: u64,
        fee: u64,
        relayer: String,
    },
    Unclassified(Unclassified),
}

#[derive(Debug, Clone)]
pub struct BalanceFlowParser {
    deposit_threshold: u64,
    withdrawal_threshold: u64,
}

impl BalanceFlowParser {
    pub fn new(deposit_threshold: u64, withdrawal_threshold: u64) -> Self {
        Self {
            deposit_threshold,
            withdrawal_threshold,
        }
    }

    pub fn decide(&self, tx: &RawTransaction) -> FlowDecision {
        if tx.meta.is_none() {
            return FlowDecision::Unclassified(Unclassified::MissingMeta);
        }
        if tx.is_failed() {
            return FlowDecision::Unclassified(Unclassified::Failed);
        }
        let Some(payer) = tx.fee_payer() else {
            return FlowDecision::Unclassified(Unclassified::MissingAccountKey);
        };

        let deltas = tx.native_deltas();
        let payer_delta = deltas.iter().find(|d| d.index == 0);
        let payer_loss = payer_delta.map(AccountDelta::loss).unwrap_or(0);
        let payer_gain = payer_delta.map(AccountDelta::gain).unwrap_or(0);
        let fee = tx.fee();

        let others: Vec<&AccountDelta> = deltas.iter().filter(|d| d.index != 0).collect();
        let max_other_gain = others.iter().map(|d| d.gain()).max().unwrap_or(0);

        if payer_loss > self.deposit_threshold && max_other_gain <= payer_loss {
            return FlowDecision::Deposit {
                depositor: payer.to_string(),
                amount: payer_loss.saturating_sub(fee),
            };
        }

        let gainers: Vec<&&AccountDelta> = others
            .iter()
            .filter(|d| d.gain() > self.withdrawal_threshold)
            .collect();

        if let Some(top) = gainers.iter().max_by_key(|d| d.gain()) {
            let top_gain = top.gain();
            if gainers.iter().filter(|d| d.gain() == top_gain).count() > 1 {
                return FlowDecision::Unclassified(Unclassified::AmbiguousGainers);
            }
            if top.address == UNKNOWN {
                return FlowDecision::Unclassified(Unclassified::MissingAccountKey);
            }
            let pool_loss = others
                .iter()
                .filter(|d| d.index != top.index)
                .map(|d| d.loss())
                .max()
                .unwrap_or(0);
            return FlowDecision::Withdrawal {
                recipient: top.address.clone(),
                amount: top_gain,
                fee: pool_loss.saturating_sub(top_gain),
                relayer: payer.to_string(),
            };
        }

        // Self-relayed withdrawal: the payer is the recipient and its gain is
        // net of the network fee.
        let gross_gain = payer_gain.saturating_add(fee);
        if payer_gain > 0 && gross_gain > self.withdrawal_threshold {
            let pool_loss = others.iter().map(|d| d.loss()).max().unwrap_or(0);
            return FlowDecision::Withdrawal {
                recipient: payer.to_string(),
                amount: gross_gain,
                fee: pool_loss.saturating_sub(gross_gain),
                relayer: UNKNOWN.to_string(),
            };
        }

        FlowDecision::Unclassified(Unclassified::NoSignificantFlow)
    }

    pub fn parse(&self, protocol: &str, tx: &RawTransaction) -> Result<DomainEvent, Unclassified> {
        let ctx = tx_context(tx)?;
        match self.decide(tx) {
            FlowDecision::Deposit { depositor, amount } => Ok(DomainEvent::Deposit(Deposit {
                protocol: protocol.to_string(),
                signature: ctx.signature.to_string(),
                timestamp: ctx.timestamp,
                slot: ctx.slot,
                amount,
                depositor,
                commitment: extract_proof_tag(tx.log_messages(), "commitment"),
                spent: false,
                spent_at: None,
                withdrawal_signature: None,
            })),
            FlowDecision::Withdrawal {
                recipient,
                amount,
                fee,
                relayer,
            } => Ok(DomainEvent::Withdrawal(Withdrawal {
                protocol: protocol.to_string(),
                signature: ctx.signature.to_string(),
                timestamp: ctx.timestamp,
                slot: ctx.slot,
                amount,
                recipient,
                nullifier: extract_proof_tag(tx.log_messages(), "nullifier"),
                relayer,
                fee,
            })),
            FlowDecision::Unclassified(reason) => Err(reason),
        }
    }
}
