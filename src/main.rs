use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use axum::extract::{Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crossbook::activity;
use crossbook::book::{Order, OrderType, Side};
use crossbook::chain::{ChainMap, MemChain, RpcChainClient, SettlementChain};
use crossbook::config::load_config;
use crossbook::error::ApiError;
use crossbook::pricing;
use crossbook::registry::Venue;
use crossbook::state::AppState;
use crossbook::tasks::start_background_tasks;

const MAX_BODY_BYTES: usize = 1 << 20;
const DEFAULT_HISTORY_LIMIT: usize = 200;
const EXTERNAL_QUOTES_BASE: &str = "https://api.gateio.ws/api/v4/spot";

// ===== Request schemas =====
//
// Numerics arrive as strings and are parsed through the fixed-precision
// decimal type; unknown fields are ignored, missing critical fields reject.

#[derive(Debug, Deserialize)]
struct RegisterOrderRequest {
    account: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    side: String,
    #[serde(rename = "type")]
    order_type: Option<String>,
    price: Option<String>,
    quantity: String,
    #[serde(rename = "fromNetwork", alias = "from_network")]
    from_network: String,
    #[serde(rename = "toNetwork", alias = "to_network")]
    to_network: String,
    #[serde(rename = "receiveWallet", alias = "receive_wallet")]
    receive_wallet: String,
}

#[derive(Debug, Deserialize)]
struct CancelOrderRequest {
    #[serde(rename = "orderId", alias = "order_id")]
    order_id: u64,
    side: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
}

#[derive(Debug, Deserialize)]
struct OrderbookRequest {
    symbol: String,
    depth: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TradesRequest {
    symbol: String,
    limit: Option<usize>,
    venue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderLookupRequest {
    #[serde(rename = "orderId", alias = "order_id")]
    order_id: u64,
}

#[derive(Debug, Deserialize)]
struct BestOrderRequest {
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    side: String,
    venue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AvailableFundsRequest {
    account: String,
    asset: String,
    network: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    // A panic anywhere in the process is unrecoverable for a matching
    // engine: books and settlement records would no longer agree.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {info}");
        std::process::exit(2);
    }));
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = runtime.block_on(run()) {
        error!("[startup] fatal error={e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cfg = Arc::new(load_config().context("configuration error")?);
    let attempt_timeout = Duration::from_millis(cfg.settle.attempt_timeout_ms);

    let mut chains: ChainMap = HashMap::new();
    for chain_cfg in &cfg.chains {
        let client: Arc<dyn SettlementChain> = if chain_cfg.rpc_url.starts_with("mem://") {
            info!(
                "[startup] in_memory_chain network={} chain_id={}",
                chain_cfg.network, chain_cfg.chain_id
            );
            Arc::new(MemChain::new(
                chain_cfg.network.clone(),
                chain_cfg.chain_id,
                chain_cfg.settlement_address,
            ))
        } else {
            let key = cfg
                .operator_key
                .as_deref()
                .context("OPERATOR_KEY is required for RPC-backed networks")?;
            let client = RpcChainClient::connect(chain_cfg, key, attempt_timeout)?;
            // The operator key must control the contract owner account, or
            // every settlement call would revert with onlyOwner.
            match client.contract_owner().await {
                Ok(owner) if owner != client.operator() => {
                    bail!(
                        "operator {} is not the settlement contract owner {} on {}",
                        client.operator(),
                        owner,
                        chain_cfg.network
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "[startup] owner_check_skipped network={} error={}",
                    chain_cfg.network, e
                ),
            }
            Arc::new(client)
        };
        chains.insert(chain_cfg.network.clone(), client);
    }

    let (state, settle_rx) = AppState::new(cfg.clone(), chains);
    start_background_tasks(state.clone(), settle_rx);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/register_order", post(register_order))
        .route("/api/register_order_cross", post(register_order_cross))
        .route("/api/cancel_order", post(cancel_order))
        .route("/api/orderbook", post(orderbook))
        .route("/api/orderbook_cross", post(orderbook_cross))
        .route("/api/order", post(order_lookup))
        .route("/api/trades", post(recent_trades))
        .route("/api/get_best_order", post(get_best_order))
        .route("/api/check_available_funds", post(check_available_funds))
        .route("/api/price", get(price_proxy))
        .route("/api/kline", get(kline_proxy))
        .route("/api/settlement_health", get(settlement_health))
        .route("/api/get_settlement_address", get(get_settlement_address))
        .route("/api/order_history", get(order_history))
        .route("/api/order_history_cross", get(order_history_cross))
        .route("/api/settlement_record", get(settlement_record))
        .route("/api/stats", get(get_stats))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.server.bind))?;
    info!("[startup] listening bind={}", cfg.server.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("[shutdown] signal received");
}

// ===== Payload handling =====

/// Accept a raw JSON body, or a form with a `payload` field carrying JSON.
async fn decode_payload(req: Request) -> Result<Value, ApiError> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::validation("unreadable request body"))?;

    if content_type.contains("application/json") {
        return serde_json::from_slice(&bytes)
            .map_err(|_| ApiError::validation("malformed JSON body"));
    }
    if content_type.contains("application/x-www-form-urlencoded") {
        let form: HashMap<String, String> = serde_urlencoded::from_bytes(&bytes)
            .map_err(|_| ApiError::validation("malformed form body"))?;
        let payload = form.get("payload").ok_or_else(|| {
            ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "Missing 'payload' form field")
        })?;
        return serde_json::from_str(payload)
            .map_err(|_| ApiError::validation("malformed JSON in 'payload' field"));
    }
    // Last resort: clients that forget the content type but send JSON.
    serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported content type"))
}

fn parse_address(raw: &str, field: &str) -> Result<Address, ApiError> {
    Address::from_str(raw.trim())
        .map_err(|_| ApiError::validation(format!("Invalid {field}: {raw:?}")))
}

fn order_json(order_id: u64, order: &Order, trades: &[crossbook::book::TradeRecord]) -> Value {
    json!({
        "orderId": order_id,
        "account": order.account,
        "price": order.price.to_string(),
        "quantity": order.quantity.to_string(),
        "side": order.side.as_str(),
        "baseAsset": order.base_asset,
        "quoteAsset": order.quote_asset,
        "fromNetwork": order.from_network,
        "toNetwork": order.to_network,
        "receiveWallet": order.receive_wallet,
        "trades": trades,
        "timestamp": order.timestamp,
    })
}

// ===== Order admission =====

async fn register_order(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    admit_order(&state, payload, Venue::SameChain).await
}

async fn register_order_cross(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    admit_order(&state, payload, Venue::CrossChain).await
}

async fn admit_order(
    state: &AppState,
    payload: Value,
    endpoint_venue: Venue,
) -> Result<Json<Value>, ApiError> {
    state.perf.orders_received.fetch_add(1, Ordering::Relaxed);
    let result = admit_order_inner(state, payload, endpoint_venue).await;
    if result.is_err() {
        state.perf.orders_rejected.fetch_add(1, Ordering::Relaxed);
    }
    result
}

async fn admit_order_inner(
    state: &AppState,
    payload: Value,
    endpoint_venue: Venue,
) -> Result<Json<Value>, ApiError> {
    let request: RegisterOrderRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::validation(format!("Invalid order payload: {e}")))?;

    let side = Side::parse(&request.side)
        .ok_or_else(|| ApiError::validation("side must be \"bid\" or \"ask\""))?;
    let order_type = match request.order_type.as_deref() {
        None | Some("") => OrderType::Limit,
        Some(raw) => OrderType::parse(raw)
            .ok_or_else(|| ApiError::validation("type must be \"limit\" or \"market\""))?,
    };

    let symbol_cfg = state
        .cfg
        .symbol_config(&request.base_asset, &request.quote_asset)
        .ok_or_else(|| {
            ApiError::validation(format!(
                "Unknown symbol {}_{}",
                request.base_asset, request.quote_asset
            ))
        })?
        .clone();
    let symbol = symbol_cfg.symbol();

    let from_network = request.from_network.trim().to_lowercase();
    let to_network = request.to_network.trim().to_lowercase();
    for network in [&from_network, &to_network] {
        if state.cfg.chain(network).is_none() {
            return Err(ApiError::validation(format!("Unknown network {network:?}")));
        }
    }
    let venue = Venue::of(&from_network, &to_network);
    if venue != endpoint_venue {
        let expectation = match endpoint_venue {
            Venue::SameChain => "fromNetwork must equal toNetwork on this endpoint",
            Venue::CrossChain => "fromNetwork must differ from toNetwork on this endpoint",
        };
        return Err(ApiError::validation(expectation));
    }

    let account = parse_address(&request.account, "account")?;
    let receive_wallet = parse_address(&request.receive_wallet, "receiveWallet")?;

    let quantity = pricing::parse_positive_decimal(&request.quantity, "quantity")?;
    if quantity < symbol_cfg.min_quantity {
        return Err(ApiError::validation(format!(
            "quantity below minimum {}",
            symbol_cfg.min_quantity
        )));
    }
    let price = match order_type {
        OrderType::Limit => {
            let raw = request
                .price
                .as_deref()
                .ok_or_else(|| ApiError::validation("price is required for limit orders"))?;
            let price = pricing::parse_positive_decimal(raw, "price")?;
            if !pricing::on_tick(price, symbol_cfg.tick_size) {
                return Err(ApiError::validation(format!(
                    "price is not a multiple of tick size {}",
                    symbol_cfg.tick_size
                )));
            }
            price
        }
        OrderType::Market => Decimal::ZERO,
    };

    let books = state.registry.get_or_create(&symbol);

    // Escrow pre-check on the submitter's from-chain. Asks require the base
    // quantity; limit bids the quote value at their limit price. Market bids
    // have no limit price, so they fund the quote cost summed over the ask
    // levels they would sweep at current depth; with an empty opposite side
    // nothing can match and there is nothing to fund.
    let escrow_check = match (order_type, side) {
        (OrderType::Limit, _) | (OrderType::Market, Side::Ask) => Some(
            state
                .orchestrator
                .pre_check(
                    account,
                    side,
                    quantity,
                    price,
                    &symbol_cfg.base,
                    &symbol_cfg.quote,
                    &from_network,
                )
                .await?,
        ),
        (OrderType::Market, Side::Bid) => {
            let (sweep_cost, fillable) = {
                let book = books.venue(venue).lock().await;
                book.sweep_cost(Side::Bid, quantity)
            };
            if fillable.is_zero() {
                None
            } else {
                Some(
                    state
                        .orchestrator
                        .pre_check_required(
                            account,
                            side,
                            &symbol_cfg.quote,
                            sweep_cost,
                            &from_network,
                        )
                        .await?,
                )
            }
        }
    };

    let order = Order {
        order_id: 0,
        account,
        base_asset: symbol_cfg.base.clone(),
        quote_asset: symbol_cfg.quote.clone(),
        side,
        order_type,
        price,
        quantity,
        from_network,
        to_network,
        receive_wallet,
        timestamp: crossbook::now_epoch_ms(),
    };

    // Admission and matching are one critical section per book.
    let (order_id, final_order, trades, rested, unfilled, next_best) = {
        let mut book = books.venue(venue).lock().await;
        match order_type {
            OrderType::Limit => {
                let result = book.process_limit(order);
                let next_best = book.best_resting(side.opposite()).cloned();
                (
                    result.order.order_id,
                    result.order,
                    result.trades,
                    result.rested,
                    None,
                    next_best,
                )
            }
            OrderType::Market => {
                let mut market_order = order;
                let result = book.process_market(market_order.clone());
                market_order.order_id = result.order_id;
                market_order.quantity = result.unfilled;
                let next_best = book.best_resting(side.opposite()).cloned();
                (
                    result.order_id,
                    market_order,
                    result.trades,
                    false,
                    Some(result.unfilled),
                    next_best,
                )
            }
        }
    };

    state
        .perf
        .trades_matched
        .fetch_add(trades.len() as u64, Ordering::Relaxed);
    state.activity.record(activity::order_placed(
        &symbol,
        venue,
        order_id,
        &format!("{account}"),
        side.as_str(),
        &final_order.price.to_string(),
        &quantity.to_string(),
        final_order.timestamp,
    ));
    for trade in &trades {
        state.activity.record(activity::trade_executed(trade, venue));
    }

    let settlement_info = if trades.is_empty() {
        json!({"settled": false, "reason": "no_trades_to_settle"})
    } else {
        let mut dispatched = 0usize;
        for trade in &trades {
            let job = state.orchestrator.dispatch(venue, trade);
            match state.settle_tx.send(job).await {
                Ok(()) => {
                    dispatched += 1;
                    state.perf.settle_dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(
                        "[settle] dispatch_failed order_id={} error={}",
                        trade.taker.order_id, e
                    );
                }
            }
        }
        json!({"settled": false, "reason": "processing_async", "dispatched": dispatched})
    };

    let mut order_body = order_json(order_id, &final_order, &trades);
    if let Some(unfilled) = unfilled {
        order_body["unfilled"] = json!(unfilled.to_string());
    }
    order_body["rested"] = json!(rested);

    Ok(Json(json!({
        "message": "Order registered successfully",
        "order": order_body,
        "nextBest": next_best.map(|o| order_json(o.order_id, &o, &[])),
        "validation_details": escrow_check,
        "settlement_info": settlement_info,
        "status_code": 1,
    })))
}

// ===== Cancel & lookups =====

async fn cancel_order(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    let request: CancelOrderRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::validation(format!("Invalid cancel payload: {e}")))?;
    Side::parse(&request.side)
        .ok_or_else(|| ApiError::validation("side must be \"bid\" or \"ask\""))?;

    let symbol = pricing::symbol_of(&request.base_asset, &request.quote_asset);
    let books = state
        .registry
        .get(&symbol)
        .ok_or_else(|| ApiError::validation(format!("Unknown symbol {symbol}")))?;

    // The payload carries no venue flag; same-chain is checked first.
    let mut cancelled = None;
    for venue in [Venue::SameChain, Venue::CrossChain] {
        let mut book = books.venue(venue).lock().await;
        if let Some(order) = book.cancel(request.order_id) {
            cancelled = Some((venue, order));
            break;
        }
    }
    let Some((venue, order)) = cancelled else {
        return Err(ApiError::not_found(format!("Order {} not found", request.order_id)));
    };

    state.perf.orders_cancelled.fetch_add(1, Ordering::Relaxed);
    state.activity.record(activity::order_cancelled(
        &symbol,
        venue,
        request.order_id,
        order.side.as_str(),
        crossbook::now_epoch_ms(),
    ));

    let mut order_body = order_json(request.order_id, &order, &[]);
    order_body["isValid"] = json!(false);
    Ok(Json(json!({
        "message": "Order cancelled successfully",
        "order": order_body,
        "status_code": 1,
    })))
}

async fn orderbook(State(state): State<AppState>, req: Request) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    snapshot_response(&state, payload, Venue::SameChain).await
}

async fn orderbook_cross(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    snapshot_response(&state, payload, Venue::CrossChain).await
}

async fn snapshot_response(
    state: &AppState,
    payload: Value,
    venue: Venue,
) -> Result<Json<Value>, ApiError> {
    let request: OrderbookRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::validation(format!("Invalid orderbook payload: {e}")))?;
    let symbol = request.symbol.to_uppercase();
    let books = state.registry.get_or_create(&symbol);
    // Read-only: hold the lock only for the copy.
    let snapshot = {
        let book = books.venue(venue).lock().await;
        book.snapshot(request.depth)
    };
    Ok(Json(json!({
        "message": "Order book retrieved successfully",
        "orderbook": snapshot,
        "status_code": 1,
    })))
}

async fn recent_trades(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    let request: TradesRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::validation(format!("Invalid trades payload: {e}")))?;
    let venue = match request.venue.as_deref() {
        None | Some("same_chain") => Venue::SameChain,
        Some("cross_chain") => Venue::CrossChain,
        Some(other) => return Err(ApiError::validation(format!("Unknown venue {other:?}"))),
    };
    let symbol = request.symbol.to_uppercase();
    let limit = request.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(1);
    let books = state.registry.get_or_create(&symbol);
    let trades = {
        let book = books.venue(venue).lock().await;
        book.tape(limit)
    };
    Ok(Json(json!({
        "message": "Trades retrieved successfully",
        "symbol": symbol,
        "trades": trades,
        "status_code": 1,
    })))
}

async fn order_lookup(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    let request: OrderLookupRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::validation(format!("Invalid order lookup payload: {e}")))?;

    for symbol in state.registry.symbols() {
        let Some(books) = state.registry.get(&symbol) else { continue };
        for venue in [Venue::SameChain, Venue::CrossChain] {
            let book = books.venue(venue).lock().await;
            if let Some(order) = book.get_order(request.order_id) {
                let body = order_json(request.order_id, order, &[]);
                return Ok(Json(json!({
                    "message": "Order retrieved successfully",
                    "order": body,
                    "venue": venue.as_str(),
                    "status_code": 1,
                })));
            }
        }
    }
    Ok(Json(json!({
        "message": "Order not found",
        "order": Value::Null,
        "status_code": 0,
    })))
}

async fn get_best_order(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    let request: BestOrderRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::validation(format!("Invalid best order payload: {e}")))?;
    let side = Side::parse(&request.side)
        .ok_or_else(|| ApiError::validation("side must be \"bid\" or \"ask\""))?;
    let venue = match request.venue.as_deref() {
        None | Some("same_chain") => Venue::SameChain,
        Some("cross_chain") => Venue::CrossChain,
        Some(other) => {
            return Err(ApiError::validation(format!("Unknown venue {other:?}")));
        }
    };

    let symbol = pricing::symbol_of(&request.base_asset, &request.quote_asset);
    let books = state.registry.get_or_create(&symbol);
    let best = {
        let book = books.venue(venue).lock().await;
        book.best_level(side)
    };
    match best {
        Some((price, quantity)) => Ok(Json(json!({
            "price": price.to_string(),
            "quantity": quantity.to_string(),
            "status_code": 1,
        }))),
        None => Ok(Json(json!({
            "message": "No resting orders on that side",
            "price": Value::Null,
            "quantity": Value::Null,
            "status_code": 0,
        }))),
    }
}

async fn check_available_funds(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_payload(req).await?;
    let request: AvailableFundsRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::validation(format!("Invalid funds payload: {e}")))?;
    let account = parse_address(&request.account, "account")?;
    let decimals = state.cfg.token_decimals(&request.asset);

    let networks: Vec<String> = match &request.network {
        Some(network) => vec![network.to_lowercase()],
        None => state.cfg.chains.iter().map(|c| c.network.clone()).collect(),
    };

    let mut total = Decimal::ZERO;
    let mut available = Decimal::ZERO;
    let mut locked = Decimal::ZERO;
    let mut per_network = serde_json::Map::new();
    for network in &networks {
        let Some(token) = state.cfg.token_address(&request.asset, network) else {
            if request.network.is_some() {
                return Err(ApiError::validation(format!(
                    "no token address configured for {} on {network}",
                    request.asset
                )));
            }
            continue;
        };
        let chain = state.orchestrator.chain(network).map_err(ApiError::from)?;
        let balance = chain
            .escrow_of(account, token, decimals)
            .await
            .map_err(ApiError::from)?;
        total += balance.total;
        available += balance.available;
        locked += balance.locked;
        per_network.insert(
            network.clone(),
            json!({
                "total": balance.total.to_string(),
                "available": balance.available.to_string(),
                "locked": balance.locked.to_string(),
            }),
        );
    }

    Ok(Json(json!({
        "message": "Available funds checked successfully",
        "account": account,
        "asset": request.asset,
        "total": total.to_string(),
        "available": available.to_string(),
        "locked": locked.to_string(),
        "networks": per_network,
        "status_code": 1,
    })))
}

// ===== External quote proxies =====

async fn price_proxy(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let pair = params
        .get("currency_pair")
        .ok_or_else(|| ApiError::validation("currency_pair is required"))?;
    let url = format!("{EXTERNAL_QUOTES_BASE}/tickers?currency_pair={pair}");
    Ok(Json(proxy_json(state, &url, "failed_to_fetch_price").await))
}

async fn kline_proxy(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let pair = params
        .get("currency_pair")
        .ok_or_else(|| ApiError::validation("currency_pair is required"))?;
    let interval = params.get("interval").map(String::as_str).unwrap_or("1h");
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(200);
    let url = format!(
        "{EXTERNAL_QUOTES_BASE}/candlesticks?currency_pair={pair}&interval={interval}&limit={limit}"
    );
    Ok(Json(proxy_json(state, &url, "failed_to_fetch_kline").await))
}

async fn proxy_json(state: AppState, url: &str, error_code: &str) -> Value {
    let response = state
        .http
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await;
    match response {
        Ok(r) => match r.error_for_status() {
            Ok(r) => r.json::<Value>().await.unwrap_or_else(|e| {
                json!({"error": error_code, "details": e.to_string()})
            }),
            Err(e) => json!({"error": error_code, "details": e.to_string()}),
        },
        Err(e) => {
            warn!("[proxy] upstream_error url={url} error={e}");
            json!({"error": error_code, "details": e.to_string()})
        }
    }
}

// ===== Settlement surface =====

async fn settlement_health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut networks = serde_json::Map::new();
    let mut all_ok = true;
    for (network, chain) in state.orchestrator.chains() {
        let ok = chain.healthy().await;
        all_ok &= ok;
        networks.insert(
            network.clone(),
            json!({
                "connected": ok,
                "chain_id": chain.chain_id(),
                "contract_address": chain.settlement_address(),
            }),
        );
    }
    let status = if all_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "ok": all_ok,
            "status": if all_ok { "healthy" } else { "degraded" },
            "networks": networks,
        })),
    )
}

async fn get_settlement_address(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let network = match params.get("network") {
        Some(network) => network.to_lowercase(),
        None => state.cfg.chains[0].network.clone(),
    };
    let chain_cfg = state
        .cfg
        .chain(&network)
        .ok_or_else(|| ApiError::validation(format!("Unknown network {network:?}")))?;
    Ok(Json(json!({
        "message": "Settlement Address",
        "data": {"settlement_address": chain_cfg.settlement_address, "network": network},
        "status_code": 200,
    })))
}

async fn settlement_record(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let order_id = params
        .get("orderId")
        .or_else(|| params.get("order_id"))
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ApiError::validation("orderId is required"))?;
    match state.orchestrator.record(order_id) {
        Some(record) => Ok(Json(json!({"record": record, "status_code": 1}))),
        None => Err(ApiError::not_found(format!("No settlement record for order {order_id}"))),
    }
}

// ===== History & stats =====

async fn order_history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    history_response(&state, params, Venue::SameChain)
}

async fn order_history_cross(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    history_response(&state, params, Venue::CrossChain)
}

fn history_response(
    state: &AppState,
    params: HashMap<String, String>,
    venue: Venue,
) -> Json<Value> {
    let symbol = params.get("symbol").map(|s| s.to_uppercase());
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_HISTORY_LIMIT);
    let items = state.activity.history(symbol.as_deref(), Some(venue), limit);
    Json(json!({
        "status_code": 1,
        "count": items.len(),
        "history": items,
    }))
}

async fn get_stats(State(state): State<AppState>) -> Json<Value> {
    Json(state.perf.snapshot_json())
}
