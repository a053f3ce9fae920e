use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use rust_decimal::Decimal;

/// Default deployment values mirror the Hedera testnet setup the contracts
/// ship with; everything is overridable per environment.
const DEFAULT_SETTLEMENT_ADDRESS: &str = "0x237458E2cF7593084Ae397a50166A275A3928bA7";
const DEFAULT_HEDERA_RPC: &str = "https://testnet.hashio.io/api";
const DEFAULT_HBAR_TOKEN: &str = "0xA219e375D1F84A50273c93FaaF5EACD285bD9990";
const DEFAULT_USDT_TOKEN: &str = "0x62bcF51859E23cc47ddc6C3144B045619476Be92";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub network: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub settlement_address: Address,
}

#[derive(Debug, Clone)]
pub struct SymbolConfig {
    pub base: String,
    pub quote: String,
    pub tick_size: Decimal,
    pub min_quantity: Decimal,
}

impl SymbolConfig {
    pub fn symbol(&self) -> String {
        crate::pricing::symbol_of(&self.base, &self.quote)
    }
}

#[derive(Debug, Clone)]
pub struct SettleConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub attempt_timeout_ms: u64,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub chains: Vec<ChainConfig>,
    pub operator_key: Option<String>,
    pub symbols: Vec<SymbolConfig>,
    /// `(TOKEN, network) -> address`; token keys are uppercase.
    pub tokens: HashMap<(String, String), Address>,
    pub decimals: HashMap<String, u32>,
    pub settle: SettleConfig,
    pub activity_log_path: String,
}

impl AppConfig {
    pub fn chain(&self, network: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.network == network)
    }

    pub fn symbol_config(&self, base: &str, quote: &str) -> Option<&SymbolConfig> {
        self.symbols.iter().find(|s| {
            s.base.eq_ignore_ascii_case(base) && s.quote.eq_ignore_ascii_case(quote)
        })
    }

    /// Resolve a token symbol to its address on one network. A missing
    /// mapping is a configuration error surfaced at admission.
    pub fn token_address(&self, token: &str, network: &str) -> Option<Address> {
        self.tokens
            .get(&(token.to_uppercase(), network.to_string()))
            .copied()
    }

    pub fn token_decimals(&self, token: &str) -> u32 {
        self.decimals.get(&token.to_uppercase()).copied().unwrap_or(18)
    }
}

pub fn load_config() -> Result<AppConfig> {
    let networks = env_list("NETWORKS", &["hedera"]);
    let mut chains = Vec::with_capacity(networks.len());
    for network in &networks {
        let network = network.to_lowercase();
        let suffix = network.to_uppercase();
        let default_rpc = if network == "hedera" { DEFAULT_HEDERA_RPC } else { "" };
        let rpc_url = env_string(&format!("RPC_URL_{suffix}"), default_rpc);
        if rpc_url.is_empty() {
            return Err(anyhow!("missing required env var: RPC_URL_{suffix}"));
        }
        let default_chain_id = if network == "hedera" { 296 } else { 0 };
        let chain_id = env_u64(&format!("CHAIN_ID_{suffix}"), default_chain_id);
        if chain_id == 0 {
            return Err(anyhow!("missing or zero CHAIN_ID_{suffix}"));
        }
        let settlement_address = env_address(
            &format!("SETTLEMENT_ADDRESS_{suffix}"),
            DEFAULT_SETTLEMENT_ADDRESS,
        )?;
        chains.push(ChainConfig { network, rpc_url, chain_id, settlement_address });
    }

    let symbol_names = env_list("SYMBOLS", &["HBAR_USDT"]);
    let mut symbols = Vec::with_capacity(symbol_names.len());
    for name in &symbol_names {
        let upper_name = name.to_uppercase();
        let Some((base, quote)) = crate::pricing::split_symbol(&upper_name) else {
            return Err(anyhow!("invalid symbol {name:?}, expected BASE_QUOTE"));
        };
        let tick_size = env_decimal(&format!("TICK_SIZE_{base}_{quote}"), "0.000001")?;
        let min_quantity = env_decimal(&format!("MIN_QUANTITY_{base}_{quote}"), "0.000001")?;
        if tick_size <= Decimal::ZERO || min_quantity <= Decimal::ZERO {
            return Err(anyhow!("tick size and minimum quantity must be positive for {name}"));
        }
        symbols.push(SymbolConfig {
            base: base.to_string(),
            quote: quote.to_string(),
            tick_size,
            min_quantity,
        });
    }

    let mut tokens = HashMap::new();
    let mut decimals = HashMap::new();
    for symbol in &symbols {
        for token in [&symbol.base, &symbol.quote] {
            let token_upper = token.to_uppercase();
            decimals.insert(token_upper.clone(), env_u32(&format!("DECIMALS_{token_upper}"), 18));
            for chain in &chains {
                let suffix = chain.network.to_uppercase();
                let default = match (token_upper.as_str(), chain.network.as_str()) {
                    ("HBAR", "hedera") => DEFAULT_HBAR_TOKEN,
                    ("USDT", "hedera") => DEFAULT_USDT_TOKEN,
                    _ => "",
                };
                let raw = env_string(&format!("TOKEN_{token_upper}_{suffix}"), default);
                if raw.is_empty() {
                    continue;
                }
                let address = Address::from_str(raw.trim())
                    .map_err(|_| anyhow!("invalid address in TOKEN_{token_upper}_{suffix}"))?;
                tokens.insert((token_upper.clone(), chain.network.clone()), address);
            }
        }
    }

    let cfg = AppConfig {
        server: ServerConfig { bind: env_string("HTTP_BIND", "0.0.0.0:8001") },
        chains,
        operator_key: std::env::var("OPERATOR_KEY").ok().filter(|k| !k.trim().is_empty()),
        symbols,
        tokens,
        decimals,
        settle: SettleConfig {
            max_attempts: env_u32("SETTLE_MAX_ATTEMPTS", 4),
            backoff_ms: env_u64("SETTLE_BACKOFF_MS", 500),
            attempt_timeout_ms: env_u64("SETTLE_ATTEMPT_TIMEOUT_MS", 15_000),
            max_concurrent: env_u64("SETTLE_MAX_CONCURRENT", 8) as usize,
        },
        activity_log_path: env_string("ACTIVITY_LOG_PATH", "orderbook_activity.jsonl"),
    };
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &AppConfig) -> Result<()> {
    if cfg.chains.is_empty() {
        return Err(anyhow!("at least one network must be configured"));
    }
    let mut seen_ids = HashSet::new();
    for chain in &cfg.chains {
        if !seen_ids.insert(chain.chain_id) {
            return Err(anyhow!("duplicate chain id {}", chain.chain_id));
        }
        // A settlement contract sharing an address with a token would make
        // escrow reads ambiguous; refuse to start.
        for ((token, network), address) in &cfg.tokens {
            if network == &chain.network && *address == chain.settlement_address {
                return Err(anyhow!(
                    "settlement address on {} collides with token {token}",
                    chain.network
                ));
            }
        }
    }
    let needs_key = cfg.chains.iter().any(|c| !c.rpc_url.starts_with("mem://"));
    if needs_key && cfg.operator_key.is_none() {
        return Err(anyhow!("missing required env var: OPERATOR_KEY"));
    }
    if cfg.settle.max_attempts == 0 {
        return Err(anyhow!("SETTLE_MAX_ATTEMPTS must be at least 1"));
    }
    Ok(())
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = env_string(key, default);
    Decimal::from_str(raw.trim()).map_err(|_| anyhow!("invalid decimal in {key}: {raw:?}"))
}

fn env_address(key: &str, default: &str) -> Result<Address> {
    let raw = env_string(key, default);
    Address::from_str(raw.trim()).map_err(|_| anyhow!("invalid address in {key}: {raw:?}"))
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => {
            let parts: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                default.iter().map(|s| (*s).to_string()).collect()
            } else {
                parts
            }
        }
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
