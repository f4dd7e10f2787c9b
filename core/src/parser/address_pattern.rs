//! Address-pattern parser
//!
//! Direction is decided by the relay set's net balance change: a net gain
//! means users paid into the relay (deposit), a net loss means the relay paid
//! out (withdrawal). When native flow is insignificant and a mint is
//! configured, the same procedure runs over that mint's token deltas grouped
//! by owner.

use std::collections::{BTreeMap, BTreeSet};

use crate::consts::UNKNOWN;
use crate::raw::RawTransaction;
use crate::types::{Deposit, Withdrawal};

use super::{extract_proof_tag, tx_context, DomainEvent, Unclassified};

/// Net movement of one party, native or token.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Flow {
    address: String,
    delta: i128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Direction {
    Inbound { depositor: String, amount: u64 },
    Outbound { recipient: String, amount: u64, fee: u64 },
}

#[derive(Debug, Clone)]
pub struct AddressPatternParser {
    relays: BTreeSet<String>,
    deposit_threshold: u64,
    withdrawal_threshold: u64,
    mint: Option<String>,
}

fn clamp_u64(value: i128) -> u64 {
    value.clamp(0, u64::MAX as i128) as u64
}

impl AddressPatternParser {
    pub fn new(
        relays: impl IntoIterator<Item = String>,
        deposit_threshold: u64,
        withdrawal_threshold: u64,
        mint: Option<String>,
    ) -> Self {
        Self {
            relays: relays.into_iter().collect(),
            deposit_threshold,
            withdrawal_threshold,
            mint,
        }
    }

    fn is_relay(&self, address: &str) -> bool {
        self.relays.contains(address)
    }

    fn native_flows(tx: &RawTransaction) -> Vec<Flow> {
        tx.native_deltas()
            .into_iter()
            .map(|d| Flow {
                address: d.address,
                delta: d.delta,
            })
            .collect()
    }

    /// Token deltas of the configured mint, summed per owner.
    fn token_flows(tx: &RawTransaction, mint: &str) -> Vec<Flow> {
        let mut by_owner: BTreeMap<String, i128> = BTreeMap::new();
        for delta in tx.token_deltas().into_iter().filter(|d| d.mint == mint) {
            let owner = delta.owner.unwrap_or_else(|| UNKNOWN.to_string());
            *by_owner.entry(owner).or_default() += delta.delta;
        }
        by_owner
            .into_iter()
            .filter(|(_, delta)| *delta != 0)
            .map(|(address, delta)| Flow { address, delta })
            .collect()
    }

    fn classify_flows(&self, flows: &[Flow]) -> Result<Direction, Unclassified> {
        let (relay, outside): (Vec<&Flow>, Vec<&Flow>) =
            flows.iter().partition(|f| self.is_relay(&f.address));
        if relay.is_empty() {
            return Err(Unclassified::RelayNotInvolved);
        }
        let relay_net: i128 = relay.iter().map(|f| f.delta).sum();

        if relay_net > 0 {
            let amount = clamp_u64(relay_net);
            if amount <= self.deposit_threshold {
                return Err(Unclassified::NoSignificantFlow);
            }
            let losers: Vec<&&Flow> = outside.iter().filter(|f| f.delta < 0).collect();
            let Some(top) = losers.iter().min_by_key(|f| f.delta) else {
                return Err(Unclassified::NoSignificantFlow);
            };
            if losers.iter().filter(|f| f.delta == top.delta).count() > 1 {
                return Err(Unclassified::AmbiguousLosers);
            }
            return Ok(Direction::Inbound {
                depositor: top.address.clone(),
                amount,
            });
        }

        if relay_net < 0 {
            let outflow = clamp_u64(-relay_net);
            if outflow <= self.withdrawal_threshold {
                return Err(Unclassified::NoSignificantFlow);
            }
            let gainers: Vec<&&Flow> = outside.iter().filter(|f| f.delta > 0).collect();
            let Some(top) = gainers.iter().max_by_key(|f| f.delta) else {
                return Err(Unclassified::NoSignificantFlow);
            };
            if gainers.iter().filter(|f| f.delta == top.delta).count() > 1 {
                return Err(Unclassified::AmbiguousGainers);
            }
            let amount = clamp_u64(top.delta);
            return Ok(Direction::Outbound {
                recipient: top.address.clone(),
                amount,
                fee: outflow.saturating_sub(amount),
            });
        }

        Err(Unclassified::NoSignificantFlow)
    }

    fn direction(&self, tx: &RawTransaction) -> Result<Direction, Unclassified> {
        let native = self.classify_flows(&Self::native_flows(tx));
        let insignificant = matches!(
            native,
            Err(Unclassified::NoSignificantFlow | Unclassified::RelayNotInvolved)
        );
        match self.mint.as_deref() {
            Some(mint) if insignificant => match self.classify_flows(&Self::token_flows(tx, mint)) {
                Ok(direction) => Ok(direction),
                // Report the native reason when the token pass saw nothing either
                Err(Unclassified::RelayNotInvolved) => native,
                Err(reason) => Err(reason),
            },
            _ => native,
        }
    }

    pub fn parse(&self, protocol: &str, tx: &RawTransaction) -> Result<DomainEvent, Unclassified> {
        let ctx = tx_context(tx)?;
        match self.direction(tx)? {
            Direction::Inbound { depositor, amount } => Ok(DomainEvent::Deposit(Deposit {
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
            Direction::Outbound {
                recipient,
                amount,
                fee,
            } => {
                let relayer = match tx.fee_payer() {
                    Some(payer) if payer != recipient && !self.is_relay(payer) => payer.to_string(),
                    _ => UNKNOWN.to_string(),
                };
                Ok(DomainEvent::Withdrawal(Withdrawal {
                    protocol: protocol.to_string(),
                    signature: ctx.signature.to_string(),
                    timestamp: ctx.timestamp,
                    slot: ctx.slot,
                    amount,
                    recipient,
                    nullifier: extract_proof_tag(tx.log_messages(), "nullifier"),
                    relayer,
                    fee,
                }))
            }
        }
    }
}
