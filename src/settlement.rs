//! Settlement orchestration for matched trades.
//!
//! The match result is authoritative and is never rolled back: every trade
//! the engine emits is driven here to a terminal state — `Settled` (both
//! legs complete), `Refunded` (asymmetric settlement detected and reversed)
//! or `Abandoned` (retries exhausted, operator attention needed). Legs of
//! one trade may run in parallel because they target different chains; the
//! chain clients serialize writes per order id.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use log::{error, info, warn};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::book::{Side, TradeParty, TradeRecord};
use crate::chain::{ChainError, ChainMap, EscrowBalance, SettlementChain, TradeData};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::pricing;
use crate::registry::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Pending,
    Settled,
    AsymmetricDetected,
    Refunded,
    Abandoned,
}

impl SettlementState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SettlementState::Settled | SettlementState::Refunded | SettlementState::Abandoned
        )
    }
}

/// Per-trade settlement record, keyed by the taker's order id.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementRecord {
    pub order_id: u64,
    pub symbol: String,
    pub venue: Venue,
    pub state: SettlementState,
    pub source_network: String,
    pub dest_network: String,
    pub source_settled: bool,
    pub dest_settled: bool,
    pub source_ts: Option<i64>,
    pub dest_ts: Option<i64>,
    pub refunded: bool,
    pub error: Option<String>,
    pub updated_at_ms: i64,
}

/// Work item handed from admission to the settlement worker.
#[derive(Debug, Clone)]
pub struct SettlementJob {
    pub venue: Venue,
    pub trade: TradeRecord,
}

/// Escrow pre-check outcome, echoed back in order responses.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowCheck {
    pub account: Address,
    pub side: Side,
    pub network: String,
    pub token: Address,
    pub required: Decimal,
    pub total: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
}

pub struct Orchestrator {
    cfg: Arc<AppConfig>,
    chains: ChainMap,
    records: DashMap<u64, SettlementRecord>,
}

impl Orchestrator {
    pub fn new(cfg: Arc<AppConfig>, chains: ChainMap) -> Self {
        Self { cfg, chains, records: DashMap::new() }
    }

    pub fn chains(&self) -> &ChainMap {
        &self.chains
    }

    pub fn chain(&self, network: &str) -> Result<&Arc<dyn SettlementChain>, ChainError> {
        self.chains
            .get(network)
            .ok_or_else(|| ChainError::Config(format!("unknown network {network:?}")))
    }

    pub fn record(&self, order_id: u64) -> Option<SettlementRecord> {
        self.records.get(&order_id).map(|r| r.clone())
    }

    /// Drop terminal records older than `ttl_ms`; returns how many.
    pub fn prune_terminal(&self, ttl_ms: i64) -> usize {
        let cutoff = crate::now_epoch_ms() - ttl_ms;
        let stale: Vec<u64> = self
            .records
            .iter()
            .filter(|r| r.state.is_terminal() && r.updated_at_ms < cutoff)
            .map(|r| *r.key())
            .collect();
        for key in &stale {
            self.records.remove(key);
        }
        stale.len()
    }

    fn update_record(&self, order_id: u64, f: impl FnOnce(&mut SettlementRecord)) {
        if let Some(mut record) = self.records.get_mut(&order_id) {
            f(&mut record);
            record.updated_at_ms = crate::now_epoch_ms();
        }
    }

    /// Escrow pre-check before matching. The check always consults the
    /// submitter's `from_network`: asks must hold the base quantity there,
    /// bids the quote value of the order at its limit price.
    pub async fn pre_check(
        &self,
        account: Address,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        base_asset: &str,
        quote_asset: &str,
        from_network: &str,
    ) -> Result<EscrowCheck, ApiError> {
        let (token_symbol, required) = match side {
            Side::Ask => (base_asset, quantity),
            Side::Bid => (quote_asset, pricing::quote_amount(price, quantity)),
        };
        self.pre_check_required(account, side, token_symbol, required, from_network)
            .await
    }

    /// Pre-check with a caller-computed requirement. Market bids fund the
    /// quote cost summed over the levels they would sweep, which a single
    /// top-of-book price would understate.
    pub async fn pre_check_required(
        &self,
        account: Address,
        side: Side,
        token_symbol: &str,
        required: Decimal,
        from_network: &str,
    ) -> Result<EscrowCheck, ApiError> {
        let token = self
            .cfg
            .token_address(token_symbol, from_network)
            .ok_or_else(|| {
                ApiError::validation(format!(
                    "no token address configured for {token_symbol} on {from_network}"
                ))
            })?;
        let decimals = self.cfg.token_decimals(token_symbol);
        let chain = self.chain(from_network).map_err(ApiError::from)?;

        let balance = self.read_escrow_with_retries(chain, account, token, decimals).await?;
        if balance.available < required {
            return Err(ApiError::insufficient_escrow(format!(
                "Insufficient available escrow balance. Required: {required}, Available: {}",
                balance.available
            )));
        }
        Ok(EscrowCheck {
            account,
            side,
            network: from_network.to_string(),
            token,
            required,
            total: balance.total,
            available: balance.available,
            locked: balance.locked,
        })
    }

    async fn read_escrow_with_retries(
        &self,
        chain: &Arc<dyn SettlementChain>,
        account: Address,
        token: Address,
        decimals: u32,
    ) -> Result<EscrowBalance, ApiError> {
        let mut delay = Duration::from_millis(self.cfg.settle.backoff_ms);
        let mut last: Option<ChainError> = None;
        for attempt in 1..=self.cfg.settle.max_attempts {
            match chain.escrow_of(account, token, decimals).await {
                Ok(balance) => return Ok(balance),
                Err(e) if e.is_transient() && attempt < self.cfg.settle.max_attempts => {
                    warn!(
                        "[escrow] read_retry network={} attempt={} error={}",
                        chain.network(),
                        attempt,
                        e
                    );
                    last = Some(e);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(ApiError::from(e)),
            }
        }
        Err(ApiError::from(last.unwrap_or_else(|| ChainError::Transient("escrow read failed".into()))))
    }

    /// Register a pending record for a freshly matched trade and produce the
    /// job the settlement worker will drive.
    pub fn dispatch(&self, venue: Venue, trade: &TradeRecord) -> SettlementJob {
        let (seller, buyer) = seller_buyer(trade);
        let record = SettlementRecord {
            order_id: trade.taker.order_id,
            symbol: trade.symbol.clone(),
            venue,
            state: SettlementState::Pending,
            source_network: seller.from_network.clone(),
            dest_network: buyer.from_network.clone(),
            source_settled: false,
            dest_settled: false,
            source_ts: None,
            dest_ts: None,
            refunded: false,
            error: None,
            updated_at_ms: crate::now_epoch_ms(),
        };
        self.records.insert(record.order_id, record);
        SettlementJob { venue, trade: trade.clone() }
    }

    /// Drive one trade to a terminal state. Returns the final state.
    pub async fn settle(&self, job: SettlementJob) -> SettlementState {
        let order_id = job.trade.taker.order_id;
        let state = match self.settle_inner(&job).await {
            Ok(state) => state,
            Err(e) => {
                error!("[settle] setup_failed order_id={} error={}", order_id, e);
                self.update_record(order_id, |r| {
                    r.state = SettlementState::Abandoned;
                    r.error = Some(e.to_string());
                });
                SettlementState::Abandoned
            }
        };
        state
    }

    async fn settle_inner(&self, job: &SettlementJob) -> Result<SettlementState, ChainError> {
        let trade = &job.trade;
        let order_id = trade.taker.order_id;
        let (seller, buyer) = seller_buyer(trade);
        let (base_asset, quote_asset) = pricing::split_symbol(&trade.symbol)
            .ok_or_else(|| ChainError::Config(format!("malformed symbol {:?}", trade.symbol)))?;

        let source_network = seller.from_network.clone();
        let dest_network = buyer.from_network.clone();
        let source_chain = self.chain(&source_network)?.clone();
        let dest_chain = self.chain(&dest_network)?.clone();

        let base_decimals = self.cfg.token_decimals(base_asset);
        let quote_decimals = self.cfg.token_decimals(quote_asset);
        let quantity = pricing::to_base_units(trade.quantity, base_decimals)
            .map_err(|e| ChainError::Config(e.to_string()))?;
        let quote_amount = quote_units_for(trade.price, trade.quantity, quote_decimals)?;
        let price_units = pricing::to_base_units(
            trade
                .price
                .round_dp_with_strategy(quote_decimals, RoundingStrategy::ToZero),
            quote_decimals,
        )
        .map_err(|e| ChainError::Config(e.to_string()))?;

        let resolve = |token: &str, network: &str| -> Result<Address, ChainError> {
            self.cfg.token_address(token, network).ok_or_else(|| {
                ChainError::Config(format!("no token address for {token} on {network}"))
            })
        };

        let base_on_source = resolve(base_asset, &source_network)?;
        let quote_on_source = resolve(quote_asset, &source_network)?;
        let seller_nonce = self
            .nonce_with_retries(&source_chain, seller.account, base_on_source)
            .await;

        let executed_at = (trade.timestamp / 1000).max(0) as u64;
        let leg = |base_token: Address, quote_token: Address, seller_nonce: u64, buyer_nonce: u64| TradeData {
            order_id,
            seller: seller.account,
            buyer: buyer.account,
            seller_receive_wallet: seller.receive_wallet,
            buyer_receive_wallet: buyer.receive_wallet,
            base_token,
            quote_token,
            price: price_units,
            quantity,
            quote_amount,
            source_chain_id: source_chain.chain_id(),
            dest_chain_id: dest_chain.chain_id(),
            executed_at,
            seller_nonce,
            buyer_nonce,
        };

        if job.venue == Venue::SameChain {
            let buyer_nonce = self
                .nonce_with_retries(&source_chain, buyer.account, quote_on_source)
                .await;
            let data = leg(base_on_source, quote_on_source, seller_nonce, buyer_nonce);
            return Ok(self.settle_same_chain(&source_chain, &data).await);
        }

        let base_on_dest = resolve(base_asset, &dest_network)?;
        let quote_on_dest = resolve(quote_asset, &dest_network)?;
        let buyer_nonce = self
            .nonce_with_retries(&dest_chain, buyer.account, quote_on_dest)
            .await;

        let source_data = leg(base_on_source, quote_on_source, seller_nonce, buyer_nonce);
        let dest_data = leg(base_on_dest, quote_on_dest, seller_nonce, buyer_nonce);

        Ok(self
            .settle_cross_chain(&source_chain, &dest_chain, &source_data, &dest_data)
            .await)
    }

    async fn settle_same_chain(
        &self,
        chain: &Arc<dyn SettlementChain>,
        data: &TradeData,
    ) -> SettlementState {
        let order_id = data.order_id;
        match self.attempt_loop("settle_same_chain", chain, data, None).await {
            Ok(()) => {
                info!(
                    "[settle] same_chain_settled order_id={} network={}",
                    order_id,
                    chain.network()
                );
                let now = crate::now_epoch_ms();
                self.update_record(order_id, |r| {
                    r.state = SettlementState::Settled;
                    r.source_settled = true;
                    r.dest_settled = true;
                    r.source_ts = Some(now);
                    r.dest_ts = Some(now);
                });
                SettlementState::Settled
            }
            Err(e) => {
                error!(
                    "[settle] same_chain_abandoned order_id={} network={} error={}",
                    order_id,
                    chain.network(),
                    e
                );
                self.update_record(order_id, |r| {
                    r.state = SettlementState::Abandoned;
                    r.error = Some(e.to_string());
                });
                SettlementState::Abandoned
            }
        }
    }

    async fn settle_cross_chain(
        &self,
        source_chain: &Arc<dyn SettlementChain>,
        dest_chain: &Arc<dyn SettlementChain>,
        source_data: &TradeData,
        dest_data: &TradeData,
    ) -> SettlementState {
        let order_id = source_data.order_id;
        let (source_result, dest_result) = tokio::join!(
            self.attempt_loop("settle_source_leg", source_chain, source_data, Some(true)),
            self.attempt_loop("settle_dest_leg", dest_chain, dest_data, Some(false)),
        );

        let now = crate::now_epoch_ms();
        self.update_record(order_id, |r| {
            if source_result.is_ok() {
                r.source_settled = true;
                r.source_ts = Some(now);
            }
            if dest_result.is_ok() {
                r.dest_settled = true;
                r.dest_ts = Some(now);
            }
        });

        match (source_result, dest_result) {
            (Ok(()), Ok(())) => {
                info!("[settle] cross_chain_settled order_id={}", order_id);
                self.update_record(order_id, |r| r.state = SettlementState::Settled);
                SettlementState::Settled
            }
            (Ok(()), Err(dest_err)) => {
                // Strict asymmetry: exactly the source leg completed.
                let _ = dest_chain
                    .report_failure(order_id, false, &dest_err.to_string())
                    .await;
                self.refund_leg(source_chain, source_data, &dest_err).await
            }
            (Err(source_err), Ok(())) => {
                let _ = source_chain
                    .report_failure(order_id, true, &source_err.to_string())
                    .await;
                self.refund_leg(dest_chain, dest_data, &source_err).await
            }
            (Err(source_err), Err(dest_err)) => {
                // Nothing settled, nothing to reverse; flag for the operator.
                error!(
                    "[settle] both_legs_failed order_id={} source_error={} dest_error={}",
                    order_id, source_err, dest_err
                );
                self.update_record(order_id, |r| {
                    r.state = SettlementState::Abandoned;
                    r.error = Some(format!("source: {source_err}; dest: {dest_err}"));
                });
                SettlementState::Abandoned
            }
        }
    }

    /// Reverse the one settled leg of an asymmetric settlement.
    async fn refund_leg(
        &self,
        settled_chain: &Arc<dyn SettlementChain>,
        data: &TradeData,
        cause: &ChainError,
    ) -> SettlementState {
        let order_id = data.order_id;
        warn!(
            "[settle] asymmetric_detected order_id={} settled_network={} cause={}",
            order_id,
            settled_chain.network(),
            cause
        );
        self.update_record(order_id, |r| {
            r.state = SettlementState::AsymmetricDetected;
            r.error = Some(cause.to_string());
        });

        let mut delay = Duration::from_millis(self.cfg.settle.backoff_ms);
        let mut last: Option<ChainError> = None;
        for attempt in 1..=self.cfg.settle.max_attempts {
            match settled_chain.emergency_refund(data).await {
                Ok(()) => {
                    info!(
                        "[settle] refunded order_id={} network={}",
                        order_id,
                        settled_chain.network()
                    );
                    self.update_record(order_id, |r| {
                        r.state = SettlementState::Refunded;
                        r.refunded = true;
                    });
                    return SettlementState::Refunded;
                }
                Err(e) => {
                    warn!(
                        "[settle] refund_attempt_failed order_id={} attempt={} error={}",
                        order_id, attempt, e
                    );
                    last = Some(e);
                    if attempt < self.cfg.settle.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        let detail = last.map(|e| e.to_string()).unwrap_or_default();
        error!("[settle] refund_abandoned order_id={} error={}", order_id, detail);
        self.update_record(order_id, |r| {
            r.state = SettlementState::Abandoned;
            r.error = Some(format!("refund failed after asymmetric settlement: {detail}"));
        });
        SettlementState::Abandoned
    }

    /// Retry wrapper for one settlement call. `leg` selects the cross-chain
    /// leg; `None` settles both legs atomically on one chain.
    async fn attempt_loop(
        &self,
        label: &str,
        chain: &Arc<dyn SettlementChain>,
        data: &TradeData,
        leg: Option<bool>,
    ) -> Result<(), ChainError> {
        let mut delay = Duration::from_millis(self.cfg.settle.backoff_ms);
        let mut last: Option<ChainError> = None;
        for attempt in 1..=self.cfg.settle.max_attempts {
            let result = match leg {
                Some(is_source) => {
                    let (sender, token, amount) = if is_source {
                        (data.seller, data.base_token, data.quantity)
                    } else {
                        (data.buyer, data.quote_token, data.quote_amount)
                    };
                    match chain.lock(sender, token, amount, data.order_id).await {
                        Ok(()) => chain.settle_cross_leg(data, is_source).await,
                        Err(e) => Err(e),
                    }
                }
                None => chain.settle_same_chain(data).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "[settle] attempt_failed label={} order_id={} network={} attempt={} error={}",
                        label,
                        data.order_id,
                        chain.network(),
                        attempt,
                        e
                    );
                    last = Some(e);
                    if attempt < self.cfg.settle.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| ChainError::Transient(format!("{label}: no attempts made"))))
    }

    async fn nonce_with_retries(
        &self,
        chain: &Arc<dyn SettlementChain>,
        user: Address,
        token: Address,
    ) -> u64 {
        let mut delay = Duration::from_millis(self.cfg.settle.backoff_ms);
        for attempt in 1..=self.cfg.settle.max_attempts {
            match chain.user_nonce(user, token).await {
                Ok(nonce) => return nonce,
                Err(e) => {
                    warn!(
                        "[settle] nonce_read_failed network={} attempt={} error={}",
                        chain.network(),
                        attempt,
                        e
                    );
                    if attempt < self.cfg.settle.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        // Settlement idempotency does not depend on the nonce value, so a
        // persistently unreadable nonce degrades to zero instead of blocking.
        0
    }
}

/// Normalize a trade's parties so the ask side is the seller.
fn seller_buyer(trade: &TradeRecord) -> (&TradeParty, &TradeParty) {
    if trade.maker.side == Side::Ask {
        (&trade.maker, &trade.taker)
    } else {
        (&trade.taker, &trade.maker)
    }
}

/// Value that cannot be represented exactly on-chain is truncated, never
/// rounded up: the contract transfers at most what was locked.
pub fn quote_units_for(price: Decimal, quantity: Decimal, quote_decimals: u32) -> Result<U256, ChainError> {
    let value = pricing::quote_amount(price, quantity)
        .round_dp_with_strategy(quote_decimals, RoundingStrategy::ToZero);
    pricing::to_base_units(value, quote_decimals).map_err(|e| ChainError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{Book, Order, OrderType};
    use crate::chain::MemChain;
    use crate::config::ChainConfig;
    use std::collections::HashMap;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn test_cfg() -> Arc<AppConfig> {
        let mut tokens = HashMap::new();
        for network in ["hedera", "polygon"] {
            tokens.insert(("HBAR".to_string(), network.to_string()), addr(0xB1));
            tokens.insert(("USDT".to_string(), network.to_string()), addr(0xC1));
        }
        let mut decimals = HashMap::new();
        decimals.insert("HBAR".to_string(), 8u32);
        decimals.insert("USDT".to_string(), 6u32);
        Arc::new(AppConfig {
            server: crate::config::ServerConfig { bind: "127.0.0.1:0".into() },
            chains: vec![
                ChainConfig {
                    network: "hedera".into(),
                    rpc_url: "mem://hedera".into(),
                    chain_id: 296,
                    settlement_address: addr(0xE1),
                },
                ChainConfig {
                    network: "polygon".into(),
                    rpc_url: "mem://polygon".into(),
                    chain_id: 137,
                    settlement_address: addr(0xE2),
                },
            ],
            operator_key: None,
            symbols: vec![crate::config::SymbolConfig {
                base: "HBAR".into(),
                quote: "USDT".into(),
                tick_size: "0.000001".parse().unwrap(),
                min_quantity: "0.000001".parse().unwrap(),
            }],
            tokens,
            decimals,
            settle: crate::config::SettleConfig {
                max_attempts: 3,
                backoff_ms: 1,
                attempt_timeout_ms: 1_000,
                max_concurrent: 4,
            },
            activity_log_path: "/dev/null".into(),
        })
    }

    fn order(side: Side, network: &str, account: u8, wallet: u8) -> Order {
        Order {
            order_id: 0,
            account: addr(account),
            base_asset: "HBAR".into(),
            quote_asset: "USDT".into(),
            side,
            order_type: OrderType::Limit,
            price: "5".parse().unwrap(),
            quantity: "100".parse().unwrap(),
            from_network: network.into(),
            to_network: network.into(),
            receive_wallet: addr(wallet),
            timestamp: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn same_chain_trade_settles_on_one_chain() {
        let cfg = test_cfg();
        let hedera = Arc::new(MemChain::new("hedera", 296, addr(0xE1)));
        // Seller holds base, buyer holds quote, both on hedera.
        hedera.deposit(addr(1), addr(0xB1), pricing::to_base_units("100".parse().unwrap(), 8).unwrap()).await;
        hedera.deposit(addr(2), addr(0xC1), pricing::to_base_units("500".parse().unwrap(), 6).unwrap()).await;

        let mut chains: ChainMap = HashMap::new();
        chains.insert("hedera".to_string(), hedera.clone() as Arc<dyn SettlementChain>);
        let orchestrator = Orchestrator::new(cfg, chains);

        let mut book = Book::new("HBAR_USDT");
        book.process_limit(order(Side::Ask, "hedera", 1, 0x11));
        let result = book.process_limit(order(Side::Bid, "hedera", 2, 0x12));
        assert_eq!(result.trades.len(), 1);

        let job = orchestrator.dispatch(Venue::SameChain, &result.trades[0]);
        let state = orchestrator.settle(job).await;
        assert_eq!(state, SettlementState::Settled);

        let record = orchestrator.record(result.trades[0].taker.order_id).unwrap();
        assert!(record.source_settled && record.dest_settled);
        assert_eq!(record.state, SettlementState::Settled);

        // Buyer received 100 HBAR at their receive wallet, seller 500 USDT.
        let base_units = pricing::to_base_units("100".parse().unwrap(), 8).unwrap();
        let quote_units = pricing::to_base_units("500".parse().unwrap(), 6).unwrap();
        assert_eq!(hedera.wallet_balance(addr(0x12), addr(0xB1)).await, base_units);
        assert_eq!(hedera.wallet_balance(addr(0x11), addr(0xC1)).await, quote_units);
    }

    #[tokio::test]
    async fn pre_check_rejects_underfunded_submitter() {
        let cfg = test_cfg();
        let hedera = Arc::new(MemChain::new("hedera", 296, addr(0xE1)));
        hedera.deposit(addr(1), addr(0xB1), U256::from(1u64)).await;
        let mut chains: ChainMap = HashMap::new();
        chains.insert("hedera".to_string(), hedera as Arc<dyn SettlementChain>);
        let orchestrator = Orchestrator::new(cfg, chains);

        let err = orchestrator
            .pre_check(
                addr(1),
                Side::Ask,
                "100".parse().unwrap(),
                "5".parse().unwrap(),
                "HBAR",
                "USDT",
                "hedera",
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn pre_check_uses_from_network_for_bids() {
        let cfg = test_cfg();
        let hedera = Arc::new(MemChain::new("hedera", 296, addr(0xE1)));
        let polygon = Arc::new(MemChain::new("polygon", 137, addr(0xE2)));
        // Bid submitter funds quote escrow on their own from-chain (polygon).
        polygon
            .deposit(addr(2), addr(0xC1), pricing::to_base_units("500".parse().unwrap(), 6).unwrap())
            .await;
        let mut chains: ChainMap = HashMap::new();
        chains.insert("hedera".to_string(), hedera as Arc<dyn SettlementChain>);
        chains.insert("polygon".to_string(), polygon as Arc<dyn SettlementChain>);
        let orchestrator = Orchestrator::new(cfg, chains);

        let check = orchestrator
            .pre_check(
                addr(2),
                Side::Bid,
                "100".parse().unwrap(),
                "5".parse().unwrap(),
                "HBAR",
                "USDT",
                "polygon",
            )
            .await
            .unwrap();
        assert_eq!(check.network, "polygon");
        assert_eq!(check.required, Decimal::from(500));
    }

    #[tokio::test]
    async fn pre_check_required_funds_a_multi_level_sweep() {
        let cfg = test_cfg();
        let hedera = Arc::new(MemChain::new("hedera", 296, addr(0xE1)));
        hedera
            .deposit(addr(2), addr(0xC1), pricing::to_base_units("520".parse().unwrap(), 6).unwrap())
            .await;
        let mut chains: ChainMap = HashMap::new();
        chains.insert("hedera".to_string(), hedera as Arc<dyn SettlementChain>);
        let orchestrator = Orchestrator::new(cfg, chains);

        // A sweep costing more than the best-ask value still passes as long
        // as escrow covers the summed cost, and fails just above it.
        let check = orchestrator
            .pre_check_required(addr(2), Side::Bid, "USDT", "520".parse().unwrap(), "hedera")
            .await
            .unwrap();
        assert_eq!(check.required, Decimal::from(520));

        let err = orchestrator
            .pre_check_required(addr(2), Side::Bid, "USDT", "520.000001".parse().unwrap(), "hedera")
            .await
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn quote_units_truncate_to_token_precision() {
        let units = quote_units_for("1.000001".parse().unwrap(), "0.000001".parse().unwrap(), 6)
            .unwrap();
        // 1.000001e-6 truncates to 0.000001 quote units.
        assert_eq!(units, U256::from(1u64));
    }
}
