//! Chain clients: one thin interface per EVM chain.
//!
//! Every write carries the taker's order id; a replay guard keyed by
//! `(order_id, chain_id)` exists both on-chain and in the client's local
//! cache, so repeating a settled call is a no-op. Writes for a single order
//! id are serialized per chain; distinct orders settle concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::ChainConfig;
use crate::escrow::EscrowLedger;
use crate::pricing;

#[derive(Debug, Error)]
pub enum ChainError {
    /// RPC timeout, connectivity, mirror-node lag: retried with backoff.
    #[error("transient chain error: {0}")]
    Transient(String),
    /// On-chain revert with a reason: permanent for the attempted call.
    #[error("chain revert: {0}")]
    Revert(String),
    #[error("insufficient escrow: required {required} {asset}, available {available}")]
    InsufficientEscrow { required: Decimal, available: Decimal, asset: String },
    #[error("chain configuration error: {0}")]
    Config(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EscrowBalance {
    pub total: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
}

/// Canonical descriptor for one settlement leg, with token addresses and
/// amounts already resolved for the chain the call targets. Amounts are in
/// integer base units of the respective token.
#[derive(Debug, Clone)]
pub struct TradeData {
    /// Book-assigned id of the taker's order.
    pub order_id: u64,
    pub seller: Address,
    pub buyer: Address,
    /// Where the seller receives quote funds (on the destination chain).
    pub seller_receive_wallet: Address,
    /// Where the buyer receives base funds (on the source chain).
    pub buyer_receive_wallet: Address,
    pub base_token: Address,
    pub quote_token: Address,
    pub price: U256,
    pub quantity: U256,
    pub quote_amount: U256,
    pub source_chain_id: u64,
    pub dest_chain_id: u64,
    pub executed_at: u64,
    pub seller_nonce: u64,
    pub buyer_nonce: u64,
}

#[async_trait]
pub trait SettlementChain: Send + Sync {
    fn network(&self) -> &str;
    fn chain_id(&self) -> u64;
    fn settlement_address(&self) -> Address;

    async fn escrow_of(
        &self,
        user: Address,
        token: Address,
        decimals: u32,
    ) -> Result<EscrowBalance, ChainError>;

    async fn user_nonce(&self, user: Address, token: Address) -> Result<u64, ChainError>;

    /// Ensure `amount` of `token` is locked for `user` under `order_id`.
    /// Repeat calls for the same order are no-ops.
    async fn lock(
        &self,
        user: Address,
        token: Address,
        amount: U256,
        order_id: u64,
    ) -> Result<(), ChainError>;

    /// Both legs on this chain, atomically. Idempotent per order id.
    async fn settle_same_chain(&self, trade: &TradeData) -> Result<(), ChainError>;

    /// One leg of a cross-chain trade: base to the buyer's receive wallet on
    /// the source chain, quote to the seller's on the destination chain.
    async fn settle_cross_leg(&self, trade: &TradeData, is_source: bool) -> Result<(), ChainError>;

    async fn report_failure(
        &self,
        order_id: u64,
        is_source: bool,
        reason: &str,
    ) -> Result<(), ChainError>;

    /// Reverse the leg previously settled on this chain, returning funds from
    /// the credited receive wallet to the original sender.
    async fn emergency_refund(&self, trade: &TradeData) -> Result<(), ChainError>;

    async fn healthy(&self) -> bool;
}

/// Per-order write serialization for one chain.
#[derive(Debug, Default)]
struct OrderSerial {
    locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl OrderSerial {
    async fn acquire(&self, order_id: u64) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

fn classify(error: &dyn std::fmt::Display) -> ChainError {
    let text = error.to_string();
    if text.contains("revert") || text.contains("execution reverted") {
        ChainError::Revert(text)
    } else {
        ChainError::Transient(text)
    }
}

sol! {
    #[sol(rpc)]
    contract TradeSettlement {
        struct CrossChainTradeData {
            uint256 orderId;
            address seller;
            address buyer;
            address sellerReceiveWallet;
            address buyerReceiveWallet;
            address baseToken;
            address quoteToken;
            uint256 price;
            uint256 quantity;
            uint256 quoteAmount;
            uint256 sourceChainId;
            uint256 destChainId;
            uint256 executedAt;
            uint256 sellerNonce;
            uint256 buyerNonce;
        }

        function owner() external view returns (address);
        function escrowBalances(address user, address token) external view returns (uint256);
        function lockedBalances(address user, address token) external view returns (uint256);
        function nonces(address user, address token) external view returns (uint256);
        function orderLocksByChain(uint256 orderId, uint256 chainId) external view returns (bool);
        function settlementByChain(uint256 orderId, uint256 chainId) external view returns (bool);
        function lockEscrowForOrder(address user, address token, uint256 amount, uint256 orderId) external;
        function settleSameChainTrade(CrossChainTradeData memory tradeData) external;
        function settleCrossChainTrade(CrossChainTradeData memory tradeData, bool isSourceChain) external;
        function reportSettlementFailure(uint256 orderId, uint256 chainId, bool isSourceChain, string memory reason) external;
        function emergencyRefundAsymmetricSettlement(uint256 orderId, CrossChainTradeData memory tradeData) external;
    }
}

/// JSON-RPC client for one chain's settlement contract, signing with the
/// operator key. The operator must be the contract owner.
pub struct RpcChainClient {
    network: String,
    chain_id: u64,
    address: Address,
    operator: Address,
    provider: DynProvider,
    contract: TradeSettlement::TradeSettlementInstance<DynProvider>,
    attempt_timeout: Duration,
    settled: DashMap<u64, ()>,
    locked_orders: DashMap<u64, ()>,
    serial: OrderSerial,
}

impl RpcChainClient {
    pub fn connect(
        cfg: &ChainConfig,
        operator_key: &str,
        attempt_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let signer: PrivateKeySigner = operator_key
            .trim()
            .parse()
            .context("invalid operator key")?;
        let operator = signer.address();
        let wallet = EthereumWallet::from(signer);
        let url: reqwest::Url = cfg
            .rpc_url
            .parse()
            .with_context(|| format!("invalid rpc url for network {}", cfg.network))?;
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(url).erased();
        let contract = TradeSettlement::new(cfg.settlement_address, provider.clone());
        info!(
            "[chain] connected network={} chain_id={} contract={} operator={}",
            cfg.network, cfg.chain_id, cfg.settlement_address, operator
        );
        Ok(Self {
            network: cfg.network.clone(),
            chain_id: cfg.chain_id,
            address: cfg.settlement_address,
            operator,
            provider,
            contract,
            attempt_timeout,
            settled: DashMap::new(),
            locked_orders: DashMap::new(),
            serial: OrderSerial::default(),
        })
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    /// Contract owner, used by the startup sanity check: the operator key
    /// must control the owner account or every settlement would revert.
    pub async fn contract_owner(&self) -> Result<Address, ChainError> {
        match tokio::time::timeout(self.attempt_timeout, self.contract.owner().call()).await {
            Ok(result) => result.map_err(|e| classify(&e)),
            Err(_) => Err(ChainError::Transient("rpc timeout reading owner".into())),
        }
    }

    /// Run a contract view call under the per-attempt timeout.
    async fn view<T, F>(&self, fut: F) -> Result<T, ChainError>
    where
        F: std::future::IntoFuture<Output = Result<T, alloy::contract::Error>>,
        F::IntoFuture: Send,
    {
        match tokio::time::timeout(self.attempt_timeout, fut.into_future()).await {
            Ok(result) => result.map_err(|e| classify(&e)),
            Err(_) => Err(ChainError::Transient("rpc timeout".into())),
        }
    }

    /// Submit a state-changing call and wait for its receipt.
    async fn send_and_confirm<F>(&self, label: &str, send: F) -> Result<(), ChainError>
    where
        F: std::future::Future<
                Output = Result<
                    alloy::providers::PendingTransactionBuilder<alloy::network::Ethereum>,
                    alloy::contract::Error,
                >,
            > + Send,
    {
        let network = self.network.clone();
        let drive = async move {
            let pending = send.await.map_err(|e| classify(&e))?;
            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| ChainError::Transient(e.to_string()))?;
            if receipt.status() {
                debug!(
                    "[chain] tx_ok network={} label={} tx={}",
                    network, label, receipt.transaction_hash
                );
                Ok(())
            } else {
                Err(ChainError::Revert(format!(
                    "{label} reverted in tx {}",
                    receipt.transaction_hash
                )))
            }
        };
        match tokio::time::timeout(self.attempt_timeout, drive).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Transient(format!("{label} timed out"))),
        }
    }

    fn trade_struct(trade: &TradeData) -> TradeSettlement::CrossChainTradeData {
        TradeSettlement::CrossChainTradeData {
            orderId: U256::from(trade.order_id),
            seller: trade.seller,
            buyer: trade.buyer,
            sellerReceiveWallet: trade.seller_receive_wallet,
            buyerReceiveWallet: trade.buyer_receive_wallet,
            baseToken: trade.base_token,
            quoteToken: trade.quote_token,
            price: trade.price,
            quantity: trade.quantity,
            quoteAmount: trade.quote_amount,
            sourceChainId: U256::from(trade.source_chain_id),
            destChainId: U256::from(trade.dest_chain_id),
            executedAt: U256::from(trade.executed_at),
            sellerNonce: U256::from(trade.seller_nonce),
            buyerNonce: U256::from(trade.buyer_nonce),
        }
    }
}

#[async_trait]
impl SettlementChain for RpcChainClient {
    fn network(&self) -> &str {
        &self.network
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn settlement_address(&self) -> Address {
        self.address
    }

    async fn escrow_of(
        &self,
        user: Address,
        token: Address,
        decimals: u32,
    ) -> Result<EscrowBalance, ChainError> {
        let total_units = self.view(self.contract.escrowBalances(user, token).call()).await?;
        let locked_units = self.view(self.contract.lockedBalances(user, token).call()).await?;
        let total = pricing::from_base_units(total_units, decimals)
            .map_err(|e| ChainError::Config(e.to_string()))?;
        let locked = pricing::from_base_units(locked_units, decimals)
            .map_err(|e| ChainError::Config(e.to_string()))?;
        Ok(EscrowBalance { total, available: total - locked, locked })
    }

    async fn user_nonce(&self, user: Address, token: Address) -> Result<u64, ChainError> {
        let nonce = self.view(self.contract.nonces(user, token).call()).await?;
        u64::try_from(nonce).map_err(|_| ChainError::Config("nonce out of range".into()))
    }

    async fn lock(
        &self,
        user: Address,
        token: Address,
        amount: U256,
        order_id: u64,
    ) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(order_id).await;
        if self.locked_orders.contains_key(&order_id) {
            return Ok(());
        }
        let already = self
            .view(
                self.contract
                    .orderLocksByChain(U256::from(order_id), U256::from(self.chain_id))
                    .call(),
            )
            .await?;
        if !already {
            self.send_and_confirm(
                "lockEscrowForOrder",
                self.contract
                    .lockEscrowForOrder(user, token, amount, U256::from(order_id))
                    .send(),
            )
            .await?;
        }
        self.locked_orders.insert(order_id, ());
        Ok(())
    }

    async fn settle_same_chain(&self, trade: &TradeData) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(trade.order_id).await;
        if self.settled.contains_key(&trade.order_id) {
            return Ok(());
        }
        let already = self
            .view(
                self.contract
                    .settlementByChain(U256::from(trade.order_id), U256::from(self.chain_id))
                    .call(),
            )
            .await?;
        if !already {
            self.send_and_confirm(
                "settleSameChainTrade",
                self.contract.settleSameChainTrade(Self::trade_struct(trade)).send(),
            )
            .await?;
        }
        self.settled.insert(trade.order_id, ());
        Ok(())
    }

    async fn settle_cross_leg(&self, trade: &TradeData, is_source: bool) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(trade.order_id).await;
        if self.settled.contains_key(&trade.order_id) {
            return Ok(());
        }
        let already = self
            .view(
                self.contract
                    .settlementByChain(U256::from(trade.order_id), U256::from(self.chain_id))
                    .call(),
            )
            .await?;
        if !already {
            self.send_and_confirm(
                "settleCrossChainTrade",
                self.contract
                    .settleCrossChainTrade(Self::trade_struct(trade), is_source)
                    .send(),
            )
            .await?;
        }
        self.settled.insert(trade.order_id, ());
        Ok(())
    }

    async fn report_failure(
        &self,
        order_id: u64,
        is_source: bool,
        reason: &str,
    ) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(order_id).await;
        warn!(
            "[chain] report_failure network={} order_id={} is_source={} reason={}",
            self.network, order_id, is_source, reason
        );
        self.send_and_confirm(
            "reportSettlementFailure",
            self.contract
                .reportSettlementFailure(
                    U256::from(order_id),
                    U256::from(self.chain_id),
                    is_source,
                    reason.to_string(),
                )
                .send(),
        )
        .await
    }

    async fn emergency_refund(&self, trade: &TradeData) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(trade.order_id).await;
        self.send_and_confirm(
            "emergencyRefundAsymmetricSettlement",
            self.contract
                .emergencyRefundAsymmetricSettlement(
                    U256::from(trade.order_id),
                    Self::trade_struct(trade),
                )
                .send(),
        )
        .await
    }

    async fn healthy(&self) -> bool {
        tokio::time::timeout(self.attempt_timeout, self.provider.get_chain_id())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// Per-order settlement status tracked by the in-memory chain, mirroring the
/// contract's `settlementStatuses` mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemSettlementStatus {
    pub source_settled: bool,
    pub dest_settled: bool,
    pub source_ts: Option<i64>,
    pub dest_ts: Option<i64>,
    pub refunded: bool,
}

/// In-process chain with full settlement-contract semantics, selected by a
/// `mem://` RPC URL. Backs tests and local runs without a live chain.
pub struct MemChain {
    network: String,
    chain_id: u64,
    address: Address,
    ledger: Mutex<EscrowLedger>,
    /// One escrow lock per `(order_id, user, token)`; repeats are no-ops.
    order_locks: DashMap<(u64, Address, Address), ()>,
    settled: DashMap<u64, ()>,
    statuses: DashMap<u64, MemSettlementStatus>,
    serial: OrderSerial,
}

impl MemChain {
    pub fn new(network: impl Into<String>, chain_id: u64, address: Address) -> Self {
        Self {
            network: network.into(),
            chain_id,
            address,
            ledger: Mutex::new(EscrowLedger::new()),
            order_locks: DashMap::new(),
            settled: DashMap::new(),
            statuses: DashMap::new(),
            serial: OrderSerial::default(),
        }
    }

    /// User deposit entrypoint (`depositToEscrow` on-chain).
    pub async fn deposit(&self, user: Address, token: Address, amount: U256) {
        self.ledger.lock().await.deposit(user, token, amount);
    }

    pub async fn withdraw(
        &self,
        user: Address,
        token: Address,
        amount: U256,
    ) -> Result<(), ChainError> {
        self.ledger.lock().await.withdraw(user, token, amount)
    }

    pub async fn wallet_balance(&self, wallet: Address, token: Address) -> U256 {
        self.ledger.lock().await.wallet_balance(wallet, token)
    }

    pub fn status(&self, order_id: u64) -> MemSettlementStatus {
        self.statuses.get(&order_id).map(|s| *s).unwrap_or_default()
    }

    fn ensure_locked(
        &self,
        ledger: &mut EscrowLedger,
        order_id: u64,
        user: Address,
        token: Address,
        amount: U256,
    ) -> Result<(), ChainError> {
        if self.order_locks.contains_key(&(order_id, user, token)) {
            return Ok(());
        }
        ledger.lock(user, token, amount)?;
        self.order_locks.insert((order_id, user, token), ());
        Ok(())
    }
}

#[async_trait]
impl SettlementChain for MemChain {
    fn network(&self) -> &str {
        &self.network
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn settlement_address(&self) -> Address {
        self.address
    }

    async fn escrow_of(
        &self,
        user: Address,
        token: Address,
        decimals: u32,
    ) -> Result<EscrowBalance, ChainError> {
        let account = self.ledger.lock().await.account(user, token);
        let total = pricing::from_base_units(account.total, decimals)
            .map_err(|e| ChainError::Config(e.to_string()))?;
        let locked = pricing::from_base_units(account.locked, decimals)
            .map_err(|e| ChainError::Config(e.to_string()))?;
        Ok(EscrowBalance { total, available: total - locked, locked })
    }

    async fn user_nonce(&self, user: Address, token: Address) -> Result<u64, ChainError> {
        Ok(self.ledger.lock().await.nonce(user, token))
    }

    async fn lock(
        &self,
        user: Address,
        token: Address,
        amount: U256,
        order_id: u64,
    ) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(order_id).await;
        let mut ledger = self.ledger.lock().await;
        self.ensure_locked(&mut ledger, order_id, user, token, amount)
    }

    async fn settle_same_chain(&self, trade: &TradeData) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(trade.order_id).await;
        if self.settled.contains_key(&trade.order_id) {
            return Ok(());
        }
        let mut ledger = self.ledger.lock().await;
        self.ensure_locked(&mut ledger, trade.order_id, trade.seller, trade.base_token, trade.quantity)?;
        self.ensure_locked(&mut ledger, trade.order_id, trade.buyer, trade.quote_token, trade.quote_amount)?;
        // Validate both transfers before applying either so the pair stays
        // atomic under the single ledger lock.
        if ledger.account(trade.seller, trade.base_token).locked < trade.quantity {
            return Err(ChainError::Revert("seller base lock missing".into()));
        }
        if ledger.account(trade.buyer, trade.quote_token).locked < trade.quote_amount {
            return Err(ChainError::Revert("buyer quote lock missing".into()));
        }
        ledger.settle_transfer(
            trade.seller,
            trade.base_token,
            trade.quantity,
            trade.buyer_receive_wallet,
        )?;
        ledger.settle_transfer(
            trade.buyer,
            trade.quote_token,
            trade.quote_amount,
            trade.seller_receive_wallet,
        )?;
        drop(ledger);
        self.settled.insert(trade.order_id, ());
        let now = crate::now_epoch_ms();
        self.statuses.insert(
            trade.order_id,
            MemSettlementStatus {
                source_settled: true,
                dest_settled: true,
                source_ts: Some(now),
                dest_ts: Some(now),
                refunded: false,
            },
        );
        Ok(())
    }

    async fn settle_cross_leg(&self, trade: &TradeData, is_source: bool) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(trade.order_id).await;
        if self.settled.contains_key(&trade.order_id) {
            return Ok(());
        }
        let mut ledger = self.ledger.lock().await;
        if is_source {
            self.ensure_locked(&mut ledger, trade.order_id, trade.seller, trade.base_token, trade.quantity)?;
            ledger.settle_transfer(
                trade.seller,
                trade.base_token,
                trade.quantity,
                trade.buyer_receive_wallet,
            )?;
        } else {
            self.ensure_locked(&mut ledger, trade.order_id, trade.buyer, trade.quote_token, trade.quote_amount)?;
            ledger.settle_transfer(
                trade.buyer,
                trade.quote_token,
                trade.quote_amount,
                trade.seller_receive_wallet,
            )?;
        }
        drop(ledger);
        self.settled.insert(trade.order_id, ());
        let now = crate::now_epoch_ms();
        let mut status = self.statuses.entry(trade.order_id).or_default();
        if is_source {
            status.source_settled = true;
            status.source_ts = Some(now);
        } else {
            status.dest_settled = true;
            status.dest_ts = Some(now);
        }
        Ok(())
    }

    async fn report_failure(
        &self,
        order_id: u64,
        is_source: bool,
        reason: &str,
    ) -> Result<(), ChainError> {
        warn!(
            "[chain] report_failure network={} order_id={} is_source={} reason={}",
            self.network, order_id, is_source, reason
        );
        Ok(())
    }

    async fn emergency_refund(&self, trade: &TradeData) -> Result<(), ChainError> {
        let _guard = self.serial.acquire(trade.order_id).await;
        let status = self.status(trade.order_id);
        if status.refunded {
            return Ok(());
        }
        // Only the leg settled on this chain can be reversed here, and only
        // when exactly one leg of the trade completed.
        if status.source_settled == status.dest_settled {
            return Err(ChainError::Revert(
                "refund requires exactly one settled leg".into(),
            ));
        }
        {
            let mut ledger = self.ledger.lock().await;
            if status.source_settled {
                ledger.refund_transfer(
                    trade.buyer_receive_wallet,
                    trade.base_token,
                    trade.quantity,
                    trade.seller,
                )?;
            } else {
                ledger.refund_transfer(
                    trade.seller_receive_wallet,
                    trade.quote_token,
                    trade.quote_amount,
                    trade.buyer,
                )?;
            }
        }
        self.statuses.entry(trade.order_id).or_default().refunded = true;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Chain clients by network name, shared across books.
pub type ChainMap = HashMap<String, Arc<dyn SettlementChain>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn trade(order_id: u64) -> TradeData {
        TradeData {
            order_id,
            seller: addr(1),
            buyer: addr(2),
            seller_receive_wallet: addr(3),
            buyer_receive_wallet: addr(4),
            base_token: addr(0xB0),
            quote_token: addr(0xC0),
            price: U256::from(5_000_000u64),
            quantity: U256::from(100_000_000u64),
            quote_amount: U256::from(500_000_000u64),
            source_chain_id: 296,
            dest_chain_id: 296,
            executed_at: 1_700_000_000,
            seller_nonce: 0,
            buyer_nonce: 0,
        }
    }

    #[tokio::test]
    async fn lock_is_idempotent_per_order() {
        let chain = MemChain::new("hedera", 296, addr(0xEE));
        chain.deposit(addr(1), addr(0xB0), U256::from(100)).await;

        chain.lock(addr(1), addr(0xB0), U256::from(100), 7).await.unwrap();
        // Second lock under the same order id must not double-lock.
        chain.lock(addr(1), addr(0xB0), U256::from(100), 7).await.unwrap();
        let balance = chain.escrow_of(addr(1), addr(0xB0), 0).await.unwrap();
        assert_eq!(balance.locked, Decimal::from(100));
        assert_eq!(balance.available, Decimal::ZERO);
    }

    #[tokio::test]
    async fn withdraw_only_touches_available_escrow() {
        let chain = MemChain::new("hedera", 296, addr(0xEE));
        chain.deposit(addr(1), addr(0xB0), U256::from(100)).await;
        chain.lock(addr(1), addr(0xB0), U256::from(60), 5).await.unwrap();

        assert!(chain.withdraw(addr(1), addr(0xB0), U256::from(41)).await.is_err());
        chain.withdraw(addr(1), addr(0xB0), U256::from(40)).await.unwrap();
        let balance = chain.escrow_of(addr(1), addr(0xB0), 0).await.unwrap();
        assert_eq!(balance.total, Decimal::from(60));
        assert_eq!(balance.available, Decimal::ZERO);
    }

    #[tokio::test]
    async fn same_chain_settlement_is_atomic_and_idempotent() {
        let chain = MemChain::new("hedera", 296, addr(0xEE));
        let t = trade(9);
        chain.deposit(t.seller, t.base_token, t.quantity).await;
        chain.deposit(t.buyer, t.quote_token, t.quote_amount).await;

        chain.settle_same_chain(&t).await.unwrap();
        chain.settle_same_chain(&t).await.unwrap();

        assert_eq!(chain.wallet_balance(t.buyer_receive_wallet, t.base_token).await, t.quantity);
        assert_eq!(
            chain.wallet_balance(t.seller_receive_wallet, t.quote_token).await,
            t.quote_amount
        );
        let seller = chain.escrow_of(t.seller, t.base_token, 0).await.unwrap();
        assert_eq!(seller.total, Decimal::ZERO);
        assert!(chain.status(9).source_settled && chain.status(9).dest_settled);
    }

    #[tokio::test]
    async fn same_chain_settlement_fails_whole_when_quote_unfunded() {
        let chain = MemChain::new("hedera", 296, addr(0xEE));
        let t = trade(3);
        chain.deposit(t.seller, t.base_token, t.quantity).await;
        // Buyer never deposited quote funds.
        assert!(chain.settle_same_chain(&t).await.is_err());

        // Neither transfer happened: seller base still fully escrowed.
        assert_eq!(chain.wallet_balance(t.buyer_receive_wallet, t.base_token).await, U256::ZERO);
        let seller = chain.escrow_of(t.seller, t.base_token, 0).await.unwrap();
        assert_eq!(seller.total, Decimal::from(100_000_000u64));
    }

    #[tokio::test]
    async fn cross_leg_replay_is_a_no_op() {
        let chain = MemChain::new("hedera", 296, addr(0xEE));
        let t = trade(11);
        chain.deposit(t.seller, t.base_token, t.quantity).await;

        chain.settle_cross_leg(&t, true).await.unwrap();
        chain.settle_cross_leg(&t, true).await.unwrap();

        assert_eq!(chain.wallet_balance(t.buyer_receive_wallet, t.base_token).await, t.quantity);
        assert_eq!(chain.status(11).source_settled, true);
        assert_eq!(chain.status(11).dest_settled, false);
        // Nonce advanced exactly once.
        assert_eq!(chain.user_nonce(t.seller, t.base_token).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn refund_requires_exactly_one_settled_leg() {
        let chain = MemChain::new("hedera", 296, addr(0xEE));
        let t = trade(21);
        assert!(chain.emergency_refund(&t).await.is_err());

        chain.deposit(t.seller, t.base_token, t.quantity).await;
        chain.settle_cross_leg(&t, true).await.unwrap();
        chain.emergency_refund(&t).await.unwrap();
        // Refund restored the seller's escrow total.
        let seller = chain.escrow_of(t.seller, t.base_token, 0).await.unwrap();
        assert_eq!(seller.total, Decimal::from(100_000_000u64));
        assert_eq!(chain.wallet_balance(t.buyer_receive_wallet, t.base_token).await, U256::ZERO);
        // Refund replay is a no-op.
        chain.emergency_refund(&t).await.unwrap();
        assert_eq!(seller.total, Decimal::from(100_000_000u64));
    }
}
