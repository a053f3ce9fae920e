//! End-to-end settlement flows over two in-memory chains: the cross-chain
//! happy path, replayed settlement, and the asymmetric-failure refund.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;

use crossbook::book::{Book, Order, OrderType, Side, TradeRecord};
use crossbook::chain::{ChainError, ChainMap, EscrowBalance, MemChain, SettlementChain, TradeData};
use crossbook::config::{AppConfig, ChainConfig, ServerConfig, SettleConfig, SymbolConfig};
use crossbook::pricing;
use crossbook::registry::Venue;
use crossbook::settlement::{Orchestrator, SettlementState};

const HBAR_DECIMALS: u32 = 8;
const USDT_DECIMALS: u32 = 6;

fn addr(b: u8) -> Address {
    Address::repeat_byte(b)
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn units(amount: &str, decimals: u32) -> U256 {
    pricing::to_base_units(d(amount), decimals).unwrap()
}

fn hbar_token() -> Address {
    addr(0xB1)
}

fn usdt_token() -> Address {
    addr(0xC1)
}

fn config() -> Arc<AppConfig> {
    let mut tokens = HashMap::new();
    for network in ["hedera", "polygon"] {
        tokens.insert(("HBAR".to_string(), network.to_string()), hbar_token());
        tokens.insert(("USDT".to_string(), network.to_string()), usdt_token());
    }
    let mut decimals = HashMap::new();
    decimals.insert("HBAR".to_string(), HBAR_DECIMALS);
    decimals.insert("USDT".to_string(), USDT_DECIMALS);
    Arc::new(AppConfig {
        server: ServerConfig { bind: "127.0.0.1:0".into() },
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
        symbols: vec![SymbolConfig {
            base: "HBAR".into(),
            quote: "USDT".into(),
            tick_size: d("0.000001"),
            min_quantity: d("0.000001"),
        }],
        tokens,
        decimals,
        settle: SettleConfig {
            max_attempts: 3,
            backoff_ms: 1,
            attempt_timeout_ms: 1_000,
            max_concurrent: 4,
        },
        activity_log_path: "/dev/null".into(),
    })
}

/// Party A: seller on hedera, receives quote at their polygon wallet.
/// Party B: buyer on polygon, receives base at their hedera wallet.
const SELLER: u8 = 0x01;
const BUYER: u8 = 0x02;
const SELLER_WALLET_ON_DEST: u8 = 0x11;
const BUYER_WALLET_ON_SOURCE: u8 = 0x12;

fn cross_order(side: Side) -> Order {
    let (account, from, to, wallet) = match side {
        Side::Ask => (SELLER, "hedera", "polygon", SELLER_WALLET_ON_DEST),
        Side::Bid => (BUYER, "polygon", "hedera", BUYER_WALLET_ON_SOURCE),
    };
    Order {
        order_id: 0,
        account: addr(account),
        base_asset: "HBAR".into(),
        quote_asset: "USDT".into(),
        side,
        order_type: OrderType::Limit,
        price: d("5"),
        quantity: d("100"),
        from_network: from.into(),
        to_network: to.into(),
        receive_wallet: addr(wallet),
        timestamp: 1_700_000_000_000,
    }
}

fn match_cross_trade() -> TradeRecord {
    let mut book = Book::new("HBAR_USDT");
    let rested = book.process_limit(cross_order(Side::Ask));
    assert!(rested.rested && rested.trades.is_empty());
    let result = book.process_limit(cross_order(Side::Bid));
    assert_eq!(result.trades.len(), 1);
    assert!(!result.rested);
    result.trades.into_iter().next().unwrap()
}

async fn assert_escrow_identity(chain: &MemChain, user: Address, token: Address, decimals: u32) {
    let balance = chain.escrow_of(user, token, decimals).await.unwrap();
    assert!(balance.total >= Decimal::ZERO);
    assert!(balance.locked >= Decimal::ZERO);
    assert!(balance.available >= Decimal::ZERO);
    assert_eq!(balance.available + balance.locked, balance.total);
}

#[tokio::test]
async fn cross_chain_happy_path_settles_both_legs() {
    let hedera = Arc::new(MemChain::new("hedera", 296, addr(0xE1)));
    let polygon = Arc::new(MemChain::new("polygon", 137, addr(0xE2)));
    hedera.deposit(addr(SELLER), hbar_token(), units("100", HBAR_DECIMALS)).await;
    polygon.deposit(addr(BUYER), usdt_token(), units("500", USDT_DECIMALS)).await;

    let mut chains: ChainMap = HashMap::new();
    chains.insert("hedera".into(), hedera.clone() as Arc<dyn SettlementChain>);
    chains.insert("polygon".into(), polygon.clone() as Arc<dyn SettlementChain>);
    let orchestrator = Orchestrator::new(config(), chains);

    // Pre-checks pass on each submitter's from-chain.
    orchestrator
        .pre_check(addr(SELLER), Side::Ask, d("100"), d("5"), "HBAR", "USDT", "hedera")
        .await
        .unwrap();
    orchestrator
        .pre_check(addr(BUYER), Side::Bid, d("100"), d("5"), "HBAR", "USDT", "polygon")
        .await
        .unwrap();

    let trade = match_cross_trade();
    let job = orchestrator.dispatch(Venue::CrossChain, &trade);
    let state = orchestrator.settle(job).await;
    assert_eq!(state, SettlementState::Settled);

    // Source leg: 100 HBAR moved from the seller's escrow on hedera to the
    // buyer's receive wallet there.
    assert_eq!(
        hedera.wallet_balance(addr(BUYER_WALLET_ON_SOURCE), hbar_token()).await,
        units("100", HBAR_DECIMALS)
    );
    let seller_escrow = hedera.escrow_of(addr(SELLER), hbar_token(), HBAR_DECIMALS).await.unwrap();
    assert_eq!(seller_escrow.total, Decimal::ZERO);
    assert_eq!(seller_escrow.locked, Decimal::ZERO);

    // Destination leg: 500 USDT moved from the buyer's escrow on polygon to
    // the seller's receive wallet there.
    assert_eq!(
        polygon.wallet_balance(addr(SELLER_WALLET_ON_DEST), usdt_token()).await,
        units("500", USDT_DECIMALS)
    );
    let buyer_escrow = polygon.escrow_of(addr(BUYER), usdt_token(), USDT_DECIMALS).await.unwrap();
    assert_eq!(buyer_escrow.total, Decimal::ZERO);

    let record = orchestrator.record(trade.taker.order_id).unwrap();
    assert!(record.source_settled && record.dest_settled);
    assert_eq!(record.state, SettlementState::Settled);
    assert_eq!(record.source_network, "hedera");
    assert_eq!(record.dest_network, "polygon");

    assert_escrow_identity(&hedera, addr(SELLER), hbar_token(), HBAR_DECIMALS).await;
    assert_escrow_identity(&polygon, addr(BUYER), usdt_token(), USDT_DECIMALS).await;
}

#[tokio::test]
async fn replayed_settlement_is_idempotent() {
    let hedera = Arc::new(MemChain::new("hedera", 296, addr(0xE1)));
    let polygon = Arc::new(MemChain::new("polygon", 137, addr(0xE2)));
    hedera.deposit(addr(SELLER), hbar_token(), units("100", HBAR_DECIMALS)).await;
    polygon.deposit(addr(BUYER), usdt_token(), units("500", USDT_DECIMALS)).await;

    let mut chains: ChainMap = HashMap::new();
    chains.insert("hedera".into(), hedera.clone() as Arc<dyn SettlementChain>);
    chains.insert("polygon".into(), polygon.clone() as Arc<dyn SettlementChain>);
    let orchestrator = Orchestrator::new(config(), chains);

    let trade = match_cross_trade();
    let job = orchestrator.dispatch(Venue::CrossChain, &trade);
    assert_eq!(orchestrator.settle(job.clone()).await, SettlementState::Settled);
    // Driving the same job again must not move funds twice.
    assert_eq!(orchestrator.settle(job).await, SettlementState::Settled);

    assert_eq!(
        hedera.wallet_balance(addr(BUYER_WALLET_ON_SOURCE), hbar_token()).await,
        units("100", HBAR_DECIMALS)
    );
    assert_eq!(
        polygon.wallet_balance(addr(SELLER_WALLET_ON_DEST), usdt_token()).await,
        units("500", USDT_DECIMALS)
    );
    // One settlement per chain: the seller's nonce advanced exactly once.
    assert_eq!(hedera.user_nonce(addr(SELLER), hbar_token()).await.unwrap(), 1);
}

/// Chain wrapper whose cross-leg settlement permanently reverts, leaving
/// everything else (locks, reads, refunds) intact.
struct RevertingSettles {
    inner: Arc<MemChain>,
}

#[async_trait]
impl SettlementChain for RevertingSettles {
    fn network(&self) -> &str {
        self.inner.network()
    }

    fn chain_id(&self) -> u64 {
        self.inner.chain_id()
    }

    fn settlement_address(&self) -> Address {
        self.inner.settlement_address()
    }

    async fn escrow_of(
        &self,
        user: Address,
        token: Address,
        decimals: u32,
    ) -> Result<EscrowBalance, ChainError> {
        self.inner.escrow_of(user, token, decimals).await
    }

    async fn user_nonce(&self, user: Address, token: Address) -> Result<u64, ChainError> {
        self.inner.user_nonce(user, token).await
    }

    async fn lock(
        &self,
        user: Address,
        token: Address,
        amount: U256,
        order_id: u64,
    ) -> Result<(), ChainError> {
        self.inner.lock(user, token, amount, order_id).await
    }

    async fn settle_same_chain(&self, trade: &TradeData) -> Result<(), ChainError> {
        self.inner.settle_same_chain(trade).await
    }

    async fn settle_cross_leg(&self, _trade: &TradeData, _is_source: bool) -> Result<(), ChainError> {
        Err(ChainError::Revert("execution reverted: mirror node lag".into()))
    }

    async fn report_failure(
        &self,
        order_id: u64,
        is_source: bool,
        reason: &str,
    ) -> Result<(), ChainError> {
        self.inner.report_failure(order_id, is_source, reason).await
    }

    async fn emergency_refund(&self, trade: &TradeData) -> Result<(), ChainError> {
        self.inner.emergency_refund(trade).await
    }

    async fn healthy(&self) -> bool {
        self.inner.healthy().await
    }
}

#[tokio::test]
async fn asymmetric_settlement_is_refunded() {
    let hedera = Arc::new(MemChain::new("hedera", 296, addr(0xE1)));
    let polygon = Arc::new(MemChain::new("polygon", 137, addr(0xE2)));
    hedera.deposit(addr(SELLER), hbar_token(), units("100", HBAR_DECIMALS)).await;
    polygon.deposit(addr(BUYER), usdt_token(), units("500", USDT_DECIMALS)).await;

    let mut chains: ChainMap = HashMap::new();
    chains.insert("hedera".into(), hedera.clone() as Arc<dyn SettlementChain>);
    // The destination leg on polygon permanently reverts.
    chains.insert(
        "polygon".into(),
        Arc::new(RevertingSettles { inner: polygon.clone() }) as Arc<dyn SettlementChain>,
    );
    let orchestrator = Orchestrator::new(config(), chains);

    let trade = match_cross_trade();
    let job = orchestrator.dispatch(Venue::CrossChain, &trade);
    let state = orchestrator.settle(job).await;
    assert_eq!(state, SettlementState::Refunded);

    // The source leg was reversed: the 100 HBAR is back in the seller's
    // escrow and gone from the buyer's receive wallet.
    assert_eq!(hedera.wallet_balance(addr(BUYER_WALLET_ON_SOURCE), hbar_token()).await, U256::ZERO);
    let seller_escrow = hedera.escrow_of(addr(SELLER), hbar_token(), HBAR_DECIMALS).await.unwrap();
    assert_eq!(seller_escrow.total, d("100"));

    // No quote funds ever reached the seller's destination wallet.
    assert_eq!(polygon.wallet_balance(addr(SELLER_WALLET_ON_DEST), usdt_token()).await, U256::ZERO);

    let record = orchestrator.record(trade.taker.order_id).unwrap();
    assert_eq!(record.state, SettlementState::Refunded);
    assert!(record.refunded);
    assert!(record.source_settled);
    assert!(!record.dest_settled);
    assert!(record.error.is_some());
}

#[tokio::test]
async fn both_legs_failing_is_abandoned_without_transfers() {
    let hedera = Arc::new(MemChain::new("hedera", 296, addr(0xE1)));
    let polygon = Arc::new(MemChain::new("polygon", 137, addr(0xE2)));
    // Neither party funded escrow: both legs fail their lazy lock.

    let mut chains: ChainMap = HashMap::new();
    chains.insert("hedera".into(), hedera.clone() as Arc<dyn SettlementChain>);
    chains.insert("polygon".into(), polygon.clone() as Arc<dyn SettlementChain>);
    let orchestrator = Orchestrator::new(config(), chains);

    let trade = match_cross_trade();
    let job = orchestrator.dispatch(Venue::CrossChain, &trade);
    let state = orchestrator.settle(job).await;
    assert_eq!(state, SettlementState::Abandoned);

    let record = orchestrator.record(trade.taker.order_id).unwrap();
    assert!(!record.source_settled && !record.dest_settled);
    assert!(!record.refunded);
    assert_eq!(hedera.wallet_balance(addr(BUYER_WALLET_ON_SOURCE), hbar_token()).await, U256::ZERO);
    assert_eq!(polygon.wallet_balance(addr(SELLER_WALLET_ON_DEST), usdt_token()).await, U256::ZERO);
}
